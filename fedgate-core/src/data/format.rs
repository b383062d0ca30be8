use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::err::{bail, Error};

/// The data formats the gateway can materialize into the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFormat {
    Csv,
    Json,
    Parquet,
    Arrow,
    Excel,
    Text,
    Binary,
    Unknown,
}

impl ResourceFormat {
    /// Infers the format from a file extension, matched case-insensitively
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "tsv" => Self::Csv,
            "json" | "jsonl" | "ndjson" => Self::Json,
            "parquet" | "pq" => Self::Parquet,
            "arrow" | "feather" | "ipc" => Self::Arrow,
            "xlsx" | "xls" | "xlsm" | "xlsb" => Self::Excel,
            _ => Self::Unknown,
        }
    }

    /// The canonical extension used for cache file names
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Parquet => "parquet",
            Self::Arrow => "arrow",
            Self::Excel => "xlsx",
            Self::Text => "txt",
            Self::Binary | Self::Unknown => "bin",
        }
    }

    /// The engine reader function for the format.
    /// Text and unknown payloads fall back to the CSV reader.
    pub fn reader_function(&self) -> &'static str {
        match self {
            Self::Json => "read_json_auto",
            Self::Parquet => "read_parquet",
            Self::Arrow => "read_arrow",
            Self::Excel => "read_xlsx",
            Self::Csv | Self::Text | Self::Binary | Self::Unknown => "read_csv_auto",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Parquet => "parquet",
            Self::Arrow => "arrow",
            Self::Excel => "excel",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ResourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "csv" => Self::Csv,
            "json" => Self::Json,
            "parquet" => Self::Parquet,
            "arrow" => Self::Arrow,
            "excel" => Self::Excel,
            "text" => Self::Text,
            "binary" => Self::Binary,
            "unknown" => Self::Unknown,
            other => bail!("Unknown resource format: '{other}'"),
        })
    }
}
