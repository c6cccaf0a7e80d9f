//! Table and column metadata.

use serde::{Deserialize, Serialize};

/// Column metadata as reported by `INFORMATION_SCHEMA.COLUMNS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Data type (e.g., "int", "varchar", "datetime2").
    pub data_type: String,

    /// Maximum length for string/binary types (-1 for max).
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric scale.
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,
}

impl Column {
    /// Shorthand used by tests and the in-memory source.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            max_length: 0,
            precision: 0,
            scale: 0,
            is_nullable: true,
        }
    }

    /// Whether the column holds approximate floating point values.
    pub fn is_float(&self) -> bool {
        matches!(self.data_type.to_lowercase().as_str(), "float" | "real")
    }
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Bracket-quoted `[schema].[name]` for T-SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// `schema.name` for logs and messages.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Quote a T-SQL identifier with brackets, doubling any closing bracket.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_brackets() {
        assert_eq!(quote_ident("Sales"), "[Sales]");
        assert_eq!(quote_ident("odd]name"), "[odd]]name]");
    }

    #[test]
    fn test_table_ref_quoting() {
        let t = TableRef::new("dbo", "FactSales");
        assert_eq!(t.quoted(), "[dbo].[FactSales]");
        assert_eq!(t.full_name(), "dbo.FactSales");
    }

    #[test]
    fn test_float_detection() {
        assert!(Column::new("amount", "FLOAT").is_float());
        assert!(!Column::new("amount", "decimal").is_float());
    }
}
