mod format;
mod payload;
mod r#type;
mod value;

pub use format::*;
pub use payload::*;
pub use r#type::*;
pub use value::*;

use serde::{Deserialize, Serialize};

/// A JSON object representing one named-column record from a remote payload
pub type JsonRow = serde_json::Map<String, serde_json::Value>;

/// An eagerly materialized, ordered result set
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryRows {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Row values, one `Vec` per row, positionally matching `columns`
    pub rows: Vec<Vec<DataValue>>,
}

impl QueryRows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<DataValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Looks up a value in the supplied row by column name
    pub fn get<'a>(&self, row: &'a [DataValue], column: &str) -> Option<&'a DataValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        row.get(idx)
    }

    /// Renders the result set as a list of JSON objects
    pub fn to_json_rows(&self) -> Vec<JsonRow> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|v| v.to_json()))
                    .collect()
            })
            .collect()
    }
}
