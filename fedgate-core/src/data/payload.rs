use crate::err::{bail, Context, Result};

use super::JsonRow;

/// The decoded shape of a remote payload.
///
/// All provider responses funnel through [`RemotePayload::decode`] so that
/// downstream code is polymorphic over this variant only, never over raw
/// response shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePayload {
    Text(String),
    Blob(Vec<u8>),
    Rows(Vec<JsonRow>),
    Unknown,
}

impl RemotePayload {
    /// Decodes a provider response value into a payload variant.
    ///
    /// The cascade mirrors the shapes providers are known to return:
    /// `contents[0].text` / `contents[0].blob`, a `content` string, a `data`
    /// field, a bare string, or an array of row objects. Anything else maps
    /// to [`RemotePayload::Unknown`]. Invalid base64 in a `blob` is an error
    /// rather than silently producing garbage.
    pub fn decode(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => Ok(Self::Text(s.clone())),
            serde_json::Value::Array(items) => Ok(Self::from_array(items)),
            serde_json::Value::Object(obj) => {
                if let Some(first) = obj
                    .get("contents")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                {
                    if let Some(text) = first.get("text").and_then(|t| t.as_str()) {
                        return Ok(Self::Text(text.into()));
                    }
                    if let Some(blob) = first.get("blob").and_then(|b| b.as_str()) {
                        return Ok(Self::Blob(Self::decode_base64(blob)?));
                    }
                }

                if let Some(content) = obj.get("content") {
                    if let Some(s) = content.as_str() {
                        return Ok(Self::Text(s.into()));
                    }
                    if let Some(items) = content.as_array() {
                        return Ok(Self::from_array(items));
                    }
                }

                if let Some(data) = obj.get("data") {
                    return Self::decode(data);
                }

                if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                    return Ok(Self::Text(text.into()));
                }
                if let Some(blob) = obj.get("blob").and_then(|b| b.as_str()) {
                    return Ok(Self::Blob(Self::decode_base64(blob)?));
                }

                Ok(Self::Unknown)
            }
            _ => Ok(Self::Unknown),
        }
    }

    fn from_array(items: &[serde_json::Value]) -> Self {
        let rows = items
            .iter()
            .map(|i| i.as_object().cloned())
            .collect::<Option<Vec<_>>>();

        match rows {
            Some(rows) => Self::Rows(rows),
            None => Self::Text(serde_json::Value::Array(items.to_vec()).to_string()),
        }
    }

    /// Decodes base64 with strict validation of the character set.
    /// An empty decode of a non-empty source is an error.
    pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
        let trimmed = encoded.trim();
        let padding = trimmed.chars().rev().take_while(|c| *c == '=').count();
        if padding > 2 {
            bail!("Invalid base64 payload: too much padding");
        }

        let body = &trimmed[..trimmed.len() - padding];
        if !body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
        {
            bail!("Invalid base64 payload: unexpected characters");
        }

        let decoded = base64::decode(trimmed).context("Failed to decode base64 payload")?;

        if decoded.is_empty() && !trimmed.is_empty() {
            bail!("Base64 payload decoded to nothing");
        }

        Ok(decoded)
    }

    /// Attempts to reinterpret a text payload as JSON rows.
    /// Accepts a JSON array of objects or a single object.
    pub fn rows_from_text(text: &str) -> Option<Vec<JsonRow>> {
        let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;

        match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|i| match i {
                    serde_json::Value::Object(o) => Some(o),
                    _ => None,
                })
                .collect(),
            serde_json::Value::Object(obj) => Some(vec![obj]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_contents_text() {
        let value = json!({"contents": [{"text": "a,b\n1,2"}]});
        assert_eq!(
            RemotePayload::decode(&value).unwrap(),
            RemotePayload::Text("a,b\n1,2".into())
        );
    }

    #[test]
    fn test_decode_contents_blob() {
        let value = json!({"contents": [{"blob": "aGVsbG8="}]});
        assert_eq!(
            RemotePayload::decode(&value).unwrap(),
            RemotePayload::Blob(b"hello".to_vec())
        );
    }

    #[test]
    fn test_decode_invalid_base64_is_error() {
        let value = json!({"contents": [{"blob": "not base64!!"}]});
        assert!(RemotePayload::decode(&value).is_err());
    }

    #[test]
    fn test_decode_content_string() {
        let value = json!({"content": "plain"});
        assert_eq!(
            RemotePayload::decode(&value).unwrap(),
            RemotePayload::Text("plain".into())
        );
    }

    #[test]
    fn test_decode_data_field_recurses() {
        let value = json!({"data": [{"id": 1}]});
        let payload = RemotePayload::decode(&value).unwrap();
        assert!(matches!(payload, RemotePayload::Rows(ref rows) if rows.len() == 1));
    }

    #[test]
    fn test_decode_unknown_shape() {
        let value = json!({"weird": true});
        assert_eq!(RemotePayload::decode(&value).unwrap(), RemotePayload::Unknown);
        assert_eq!(
            RemotePayload::decode(&json!(42)).unwrap(),
            RemotePayload::Unknown
        );
    }

    #[test]
    fn test_rows_from_text() {
        let rows = RemotePayload::rows_from_text(r#"[{"id":1},{"id":2}]"#).unwrap();
        assert_eq!(rows.len(), 2);

        assert!(RemotePayload::rows_from_text("not json").is_none());
        assert!(RemotePayload::rows_from_text("[1,2,3]").is_none());
    }
}
