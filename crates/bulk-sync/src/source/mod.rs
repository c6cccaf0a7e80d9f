//! Source database connections.

mod memory;
mod mssql;

pub use memory::{MemorySource, MemorySourceConnection};
pub(crate) use memory::{bounds, count_duplicates, sum_avg};
pub use mssql::MssqlConnection;
