//! Format detection over extension, MIME type, and content signals.

use fedgate_core::data::ResourceFormat;

/// How far into a payload the content heuristics look
const SNIFF_WINDOW: usize = 1024;

const EXTENSION_CONFIDENCE: f64 = 0.8;
const MIME_CONFIDENCE: f64 = 0.7;
const CONTENT_CONFIDENCE: f64 = 0.9;

/// A format classification with the confidence of the winning signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedFormat {
    pub format: ResourceFormat,
    pub confidence: f64,
}

/// Classifies a payload by combining the available signals.
/// The highest-confidence signal that produces a known format wins.
pub fn detect(
    filename: Option<&str>,
    mime_type: Option<&str>,
    content: Option<&[u8]>,
) -> DetectedFormat {
    let mut signals = vec![];

    if let Some(filename) = filename {
        if let Some(ext) = filename.rsplit_once('.').map(|(_, ext)| ext) {
            let format = ResourceFormat::from_extension(ext);
            if format != ResourceFormat::Unknown {
                signals.push(DetectedFormat {
                    format,
                    confidence: EXTENSION_CONFIDENCE,
                });
            }
        }
    }

    if let Some(mime) = mime_type {
        let format = from_mime(mime);
        if format != ResourceFormat::Unknown {
            signals.push(DetectedFormat {
                format,
                confidence: MIME_CONFIDENCE,
            });
        }
    }

    if let Some(content) = content {
        let format = detect_from_content(content);
        if format != ResourceFormat::Unknown {
            signals.push(DetectedFormat {
                format,
                confidence: CONTENT_CONFIDENCE,
            });
        }
    }

    signals
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .unwrap_or(DetectedFormat {
            format: ResourceFormat::Unknown,
            confidence: 0.0,
        })
}

fn from_mime(mime: &str) -> ResourceFormat {
    let mime = mime
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "text/csv" | "text/tab-separated-values" => ResourceFormat::Csv,
        "application/json" | "application/x-ndjson" => ResourceFormat::Json,
        "application/vnd.apache.parquet" | "application/parquet" => ResourceFormat::Parquet,
        "application/vnd.apache.arrow.file" | "application/arrow" => ResourceFormat::Arrow,
        "application/vnd.ms-excel"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
            ResourceFormat::Excel
        }
        "text/plain" => ResourceFormat::Text,
        "application/octet-stream" => ResourceFormat::Binary,
        _ => ResourceFormat::Unknown,
    }
}

/// Classifies a payload by magic bytes, then by CSV/JSON heuristics over the
/// first KiB
pub fn detect_from_content(content: &[u8]) -> ResourceFormat {
    if content.starts_with(b"PAR1") {
        return ResourceFormat::Parquet;
    }
    if content.starts_with(b"ARROW1") || content.starts_with(b"FEA1") {
        return ResourceFormat::Arrow;
    }
    if content.starts_with(b"PK\x03\x04") {
        return ResourceFormat::Excel;
    }

    let window = &content[..content.len().min(SNIFF_WINDOW)];
    let text = match std::str::from_utf8(window) {
        Ok(text) => text,
        Err(_) => return ResourceFormat::Binary,
    };

    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return ResourceFormat::Json;
    }

    if looks_like_json(trimmed) {
        return ResourceFormat::Json;
    }

    if looks_like_csv(text) {
        return ResourceFormat::Csv;
    }

    ResourceFormat::Unknown
}

/// A parseable prefix or a JSONL first line counts as JSON
fn looks_like_json(text: &str) -> bool {
    if serde_json::from_str::<serde_json::Value>(text).is_ok() {
        return true;
    }

    text.lines()
        .next()
        .map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).is_ok())
        .unwrap_or(false)
}

/// At least two lines agreeing on the count of one candidate delimiter
fn looks_like_csv(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).take(8).collect();

    if lines.len() < 2 {
        return false;
    }

    for delimiter in [',', '\t', '|', ';'] {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.matches(delimiter).count())
            .collect();

        if counts[0] > 0 && counts.iter().all(|c| *c == counts[0]) {
            return true;
        }
    }

    false
}

/// Wraps the engine's reader function around a local path, escaping single
/// quotes. Unknown and plain-text payloads fall back to the CSV reader.
pub fn build_read_query(path: &str, format: ResourceFormat) -> String {
    format!("{}('{}')", format.reader_function(), path.replace('\'', "''"))
}
