//! Fire-and-forget progress notifications.
//!
//! A notifier never blocks the pipeline and never fails it: webhook posts run
//! on background tasks with a timeout and their errors are only logged.
//! Callers about to exit await [`Notifier::flush`] so the last messages still
//! go out.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn notify(&self, level: Level, message: &str);

    /// Wait up to `timeout` for notifications still in flight.
    async fn flush(&self, _timeout: Duration) {}
}

/// Sends notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: Level, message: &str) {
        match level {
            Level::Info | Level::Success => info!("{}", message),
            Level::Warning => warn!("{}", message),
            Level::Error => error!("{}", message),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts `{"text": ...}` to an incoming-webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
    pending: TaskTracker,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            pending: TaskTracker::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn notify(&self, level: Level, message: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, dropping webhook notification");
            return;
        };
        let prefix = match level {
            Level::Info => "",
            Level::Success => "[OK] ",
            Level::Warning => "[WARN] ",
            Level::Error => "[ERROR] ",
        };
        let text = format!("{}{}", prefix, message);
        let client = self.client.clone();
        let url = self.url.clone();

        self.pending.spawn_on(async move {
            let result = client
                .post(&url)
                .json(&WebhookPayload { text: &text })
                .timeout(WEBHOOK_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    debug!("Webhook returned {}", resp.status());
                }
                Err(e) => debug!("Webhook post failed: {}", e),
                Ok(_) => {}
            }
        }, &runtime);
    }

    async fn flush(&self, timeout: Duration) {
        self.pending.close();
        if tokio::time::timeout(timeout, self.pending.wait()).await.is_err() {
            warn!(
                "{} webhook notification(s) still pending after {:?}, giving up",
                self.pending.len(),
                timeout
            );
        }
        self.pending.reopen();
    }
}

/// Forwards to several notifiers.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    fn notify(&self, level: Level, message: &str) {
        for sink in &self.sinks {
            sink.notify(level, message);
        }
    }

    async fn flush(&self, timeout: Duration) {
        futures::future::join_all(self.sinks.iter().map(|sink| sink.flush(timeout))).await;
    }
}

/// Keeps every message; for tests and `--output-json` summaries.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    messages: Arc<Mutex<Vec<(Level, String)>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, level: Level, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, message.to_string()));
    }
}

/// Log sink plus the configured webhook, if any.
pub fn from_config(config: &NotifierConfig) -> Arc<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Arc::new(FanoutNotifier::new(vec![
            Arc::new(TracingNotifier),
            Arc::new(WebhookNotifier::new(url.clone())),
        ])),
        None => Arc::new(TracingNotifier),
    }
}

/// Remembers which progress milestones were already announced.
#[derive(Debug, Clone)]
pub struct MilestoneTracker {
    milestones: Vec<u8>,
    sent: BTreeSet<u8>,
}

impl MilestoneTracker {
    pub fn new(milestones: &[u8]) -> Self {
        let mut milestones = milestones.to_vec();
        milestones.sort_unstable();
        milestones.dedup();
        Self {
            milestones,
            sent: BTreeSet::new(),
        }
    }

    /// Mark milestones at or below `pct` (including ones already passed when
    /// resuming), returning the highest one not announced before.
    pub fn observe(&mut self, pct: f64) -> Option<u8> {
        let mut reached = None;
        for &m in &self.milestones {
            if pct + 1e-9 >= f64::from(m) && self.sent.insert(m) {
                reached = Some(m);
            }
        }
        reached
    }

    /// Treat milestones already passed before this run as announced.
    pub fn skip_through(&mut self, pct: f64) {
        self.observe(pct);
    }
}

/// `[████░░░░]`, 20 cells wide.
pub fn progress_bar(pct: f64) -> String {
    const WIDTH: usize = 20;
    let filled = ((WIDTH as f64) * pct.clamp(0.0, 100.0) / 100.0) as usize;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(WIDTH - filled))
}

/// `HH:MM:SS`, or `Nd HH:MM:SS` past a day. Zero or negative is `done`.
pub fn format_eta(seconds: f64) -> String {
    if seconds <= 0.0 || !seconds.is_finite() {
        return "done".to_string();
    }
    let total = seconds as u64;
    let (hours, rem) = (total / 3600, total % 3600);
    let (minutes, secs) = (rem / 60, rem % 60);
    if hours > 24 {
        format!("{}d {:02}:{:02}:{:02}", hours / 24, hours % 24, minutes, secs)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    }
}

fn format_speed(rows_per_sec: f64) -> String {
    if rows_per_sec >= 1000.0 {
        format!("{:.1}K", rows_per_sec / 1000.0)
    } else {
        format!("{:.0}", rows_per_sec)
    }
}

/// Text of a milestone notification.
pub fn milestone_message(
    table: &str,
    milestone: u8,
    pct: f64,
    rows_done: u64,
    rows_total: u64,
    elapsed: Duration,
) -> String {
    let elapsed_secs = elapsed.as_secs_f64();
    let speed = if elapsed_secs > 0.0 {
        rows_done as f64 / elapsed_secs
    } else {
        0.0
    };
    let eta = if speed > 0.0 {
        rows_total.saturating_sub(rows_done) as f64 / speed
    } else {
        0.0
    };
    format!(
        "{}: {}% milestone reached\n{} {:.1}%\n- Rows: {} / {}\n- Speed: {} rows/s\n- Elapsed: {}\n- ETA: {}",
        table,
        milestone,
        progress_bar(pct),
        pct,
        rows_done,
        rows_total,
        format_speed(speed),
        format_eta(elapsed_secs),
        format_eta(eta)
    )
}
