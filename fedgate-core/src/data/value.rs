use serde::{Deserialize, Serialize};

/// Data container for the value types that flow through the gateway.
///
/// Remote payloads arrive as JSON or delimited text and are coerced to
/// strings when materialized, so the set of variants is deliberately narrow.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8String(String),
    Binary(Vec<u8>),
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        *self == DataValue::Null
    }

    /// Coerces the value to a string, `None` for null
    pub fn to_string_coerced(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Boolean(b) => Some(b.to_string()),
            Self::Int64(i) => Some(i.to_string()),
            Self::Float64(f) => Some(f.to_string()),
            Self::Utf8String(s) => Some(s.clone()),
            Self::Binary(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Maps a JSON value onto the gateway value model
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) if n.is_i64() => Self::Int64(n.as_i64().unwrap()),
            serde_json::Value::Number(n) => Self::Float64(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::Utf8String(s.clone()),
            value => Self::Utf8String(value.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Int64(i) => serde_json::json!(i),
            Self::Float64(f) => serde_json::json!(f),
            Self::Utf8String(s) => serde_json::Value::String(s.clone()),
            Self::Binary(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::Utf8String(s.into())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::Utf8String(s)
    }
}

impl From<i64> for DataValue {
    fn from(i: i64) -> Self {
        DataValue::Int64(i)
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        DataValue::Boolean(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_value_json_round_trip() {
        let vals = vec![
            (serde_json::json!(null), DataValue::Null),
            (serde_json::json!(true), DataValue::Boolean(true)),
            (serde_json::json!(42), DataValue::Int64(42)),
            (serde_json::json!(1.5), DataValue::Float64(1.5)),
            (serde_json::json!("abc"), DataValue::Utf8String("abc".into())),
        ];

        for (json, val) in vals {
            assert_eq!(DataValue::from_json(&json), val);
            assert_eq!(val.to_json(), json);
        }
    }

    #[test]
    fn test_data_value_nested_json_coerced_to_string() {
        let json = serde_json::json!({"a": 1});
        assert_eq!(
            DataValue::from_json(&json),
            DataValue::Utf8String("{\"a\":1}".into())
        );
    }

    #[test]
    fn test_data_value_string_coercion() {
        assert_eq!(DataValue::Null.to_string_coerced(), None);
        assert_eq!(
            DataValue::Int64(7).to_string_coerced(),
            Some("7".to_string())
        );
    }
}
