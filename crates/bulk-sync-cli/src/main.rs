//! bulk-sync CLI - resumable bulk table sync from SQL Server into Synapse.

use clap::{Parser, Subcommand};
use bulk_sync::notify::progress_bar;
use bulk_sync::{Config, Orchestrator, RunReport, SyncError, TableOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// How long the final notifications may take to go out before exit.
const NOTIFY_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "bulk-sync")]
#[command(about = "Resumable bulk table sync from SQL Server into Azure Synapse")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Restrict the command to these tables (repeatable; default: all)
    #[arg(short, long = "table")]
    tables: Vec<String>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the range plan without touching the target
    Plan,

    /// Full load with resume, then reconciliation
    Run {
        /// Do not reconcile after loading
        #[arg(long)]
        skip_reconcile: bool,
    },

    /// Load rows added since the last full or delta sync
    Delta,

    /// Compare source and target without loading anything
    Reconcile,

    /// Show watermark progress per table
    Status,

    /// Forget progress so tables are replanned on the next run
    Reset {
        /// Confirm clearing the watermarks
        #[arg(long)]
        yes: bool,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(SyncError::Config)?;

    if let Commands::Reset { yes: false } = cli.command {
        return Err(SyncError::Config(
            "reset discards progress; pass --yes to confirm".to_string(),
        ));
    }

    let config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler();
    let orchestrator = Orchestrator::from_config(config)?.with_cancellation(cancel_token);

    let result = execute(&cli, &orchestrator).await;
    orchestrator.flush_notifications(NOTIFY_FLUSH_TIMEOUT).await;
    result
}

async fn execute(cli: &Cli, orchestrator: &Orchestrator) -> Result<(), SyncError> {
    match &cli.command {
        Commands::Plan => {
            let plans = orchestrator.plan(&cli.tables).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                for plan in &plans {
                    println!("{} (domain from {})", plan.table, plan.domain_source);
                    match &plan.domain {
                        Some(d) => println!(
                            "  Keys: {}..={} (~{} rows)",
                            d.min_key, d.max_key, d.total_rows
                        ),
                        None => println!("  Empty table"),
                    }
                    for range in &plan.ranges {
                        let done = if plan.completed.contains(&range.id) {
                            "done"
                        } else {
                            "pending"
                        };
                        println!(
                            "  {}  [{}, {})  ~{} rows  {}",
                            range.label(),
                            range.lower,
                            range.upper,
                            range.estimated_rows,
                            done
                        );
                    }
                }
            }
        }

        Commands::Run { skip_reconcile } => {
            let report = orchestrator.run(&cli.tables, *skip_reconcile).await?;
            print_report(&report, cli.output_json)?;
            if let Some(e) = report.to_error() {
                return Err(e);
            }
        }

        Commands::Delta => {
            let report = orchestrator.delta(&cli.tables).await?;
            print_report(&report, cli.output_json)?;
        }

        Commands::Reconcile => {
            let report = orchestrator.reconcile(&cli.tables).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
            if let Some(e) = report.to_error() {
                return Err(e);
            }
        }

        Commands::Status => {
            let records = orchestrator.status(&cli.tables).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for wm in &records {
                    println!(
                        "{:<32} {:<16} {} {:>5.1}%  ranges {}/{}  rows {}",
                        wm.table,
                        wm.status.to_string(),
                        progress_bar(wm.progress_pct()),
                        wm.progress_pct(),
                        wm.ranges_completed.len(),
                        wm.planned_ranges,
                        wm.total_rows_loaded
                    );
                    if let Some(snapshot) = wm.snapshot_cursor {
                        println!("  Snapshot cursor: {}", snapshot);
                    }
                    // The delta cursor is exclusive; show the last value loaded.
                    if let Some(next) = wm.delta_cursor {
                        println!("  Delta loaded through: {}", next - 1);
                    }
                    if let Some(ref err) = wm.last_error {
                        println!("  Last error: {}", err);
                    }
                }
            }
        }

        Commands::Reset { .. } => {
            let cleared = orchestrator.reset(&cli.tables).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&cleared)?);
            } else {
                println!("Cleared watermarks: {}", cleared.join(", "));
            }
        }

        Commands::HealthCheck => {
            let result = orchestrator.health_check().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!("  Source: OK ({}ms)", result.source_ms);
                println!("  Target: OK ({}ms)", result.target_ms);
            }
        }
    }

    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<(), SyncError> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    println!("\nSync completed!");
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    for table in &report.tables {
        let outcome = match table.outcome {
            TableOutcome::Loaded => "loaded",
            TableOutcome::Skipped => "already complete",
            TableOutcome::Delta => "delta applied",
            TableOutcome::UpToDate => "up to date",
        };
        println!(
            "  {}: {} ({} range(s) run, {} skipped, {} row(s) loaded, {} rejected)",
            table.table,
            outcome,
            table.ranges_run,
            table.ranges_skipped,
            table.rows_loaded,
            table.rows_rejected
        );
        for rejection in &table.rejections {
            println!("    Rejected {} x{}", rejection.rule, rejection.count);
        }
    }
    if let Some(ref reconciliation) = report.reconciliation {
        println!();
        print!("{}", reconciliation.render());
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM. The current range is
/// allowed to finish; no further range starts.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Finishing the current range, then stopping...",
                name
            );
            token.cancel();
        });
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing the current range, then stopping...");
            token.cancel();
        }
    });

    cancel_token
}
