//! Target warehouse connections.

mod memory;
mod synapse;

pub use memory::{MemoryTarget, MemoryTargetConnection};
pub use synapse::{copy_into_sql, create_table_sql, format_synapse_type, SynapseTarget};
