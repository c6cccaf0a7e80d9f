//! Core types and traits shared by every stage of the sync pipeline.
//!
//! - [`schema`]: table and column metadata
//! - [`value`]: owned cell values and row batches
//! - [`traits`]: source, target and probe connections

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{quote_ident, Column, TableRef};
pub use traits::{Connector, CopySource, RangeScan, SourceReader, TableProbe, TargetWriter};
pub use value::{Batch, Row, SqlNullType, SqlValue};
