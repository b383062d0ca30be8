use std::fmt;

use serde::{Deserialize, Serialize};

use super::DataValue;

/// The engine-facing data types the gateway understands.
///
/// Remote payloads materialize as VARCHAR columns, so this classification
/// mostly describes engine catalog metadata and local query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8String,
    Binary,
    Json,
    Date,
    Time,
    Timestamp,
    Unknown,
}

impl DataType {
    /// Maps an engine type name (as reported by the catalog) onto the
    /// gateway type model. Unrecognized names map to `Unknown`.
    pub fn from_engine_type(name: &str) -> Self {
        // strip decorations like VARCHAR(255) or DECIMAL(18,3)
        let base = name
            .split('(')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_uppercase();

        match base.as_str() {
            "BOOLEAN" | "BOOL" | "LOGICAL" => Self::Boolean,
            "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
            | "USMALLINT" | "UINTEGER" | "UBIGINT" => Self::Int64,
            "REAL" | "FLOAT" | "DOUBLE" | "DECIMAL" | "NUMERIC" => Self::Float64,
            "VARCHAR" | "CHAR" | "BPCHAR" | "TEXT" | "STRING" => Self::Utf8String,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => Self::Binary,
            "JSON" => Self::Json,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" | "TIMESTAMP WITH TIME ZONE" => {
                Self::Timestamp
            }
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8String => "utf8string",
            Self::Binary => "binary",
            Self::Json => "json",
            Self::Date => "date",
            Self::Time => "time",
            Self::Timestamp => "timestamp",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

impl DataValue {
    /// The type of the contained value; null has no type
    pub fn r#type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Boolean(_) => Some(DataType::Boolean),
            Self::Int64(_) => Some(DataType::Int64),
            Self::Float64(_) => Some(DataType::Float64),
            Self::Utf8String(_) => Some(DataType::Utf8String),
            Self::Binary(_) => Some(DataType::Binary),
        }
    }
}
