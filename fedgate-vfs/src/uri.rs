//! Parsing and matching of `mcp://server/path` resource references.

use fedgate_core::{
    data::ResourceFormat,
    err::{GatewayError, Result},
};
use once_cell::sync::Lazy;
use regex::Regex;

pub const URI_SCHEME: &str = "mcp://";

/// Reader functions whose bare (unquoted) argument may be a resource uri
pub const READER_FUNCTIONS: &[&str] = &[
    "read_csv_auto",
    "read_csv",
    "read_json_auto",
    "read_json",
    "read_parquet",
    "read_excel",
];

static READER_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:read_csv_auto|read_csv|read_json_auto|read_json|read_parquet|read_excel)\s*\(\s*(mcp://[^'\x22`\s,)]+)",
    )
    .unwrap()
});

/// A parsed `mcp://` resource reference.
///
/// The server name is compared case-preserving; only extensions are matched
/// case-insensitively when inferring the format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpUri {
    pub server: String,
    pub path: String,
    pub filename: Option<String>,
    pub extension: Option<String>,
    pub format: ResourceFormat,
    pub is_glob: bool,
    pub query_params: Vec<(String, String)>,
}

impl McpUri {
    /// Parses a `mcp://server/path[?query]` reference
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || GatewayError::InvalidUri(uri.to_string());

        let rest = uri.strip_prefix(URI_SCHEME).ok_or_else(invalid)?;

        let (server, rest) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        if server.is_empty() || server.contains('\\') {
            return Err(invalid().into());
        }

        let (path, query) = match rest.find('?') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        let query_params = query
            .map(|q| {
                q.split('&')
                    .filter(|kv| !kv.is_empty())
                    .map(|kv| match kv.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (kv.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let filename = path
            .rsplit('/')
            .next()
            .filter(|f| !f.is_empty())
            .map(|f| f.to_string());

        let extension = filename
            .as_deref()
            .and_then(|f| f.rsplit_once('.'))
            .map(|(_, ext)| ext.to_string())
            .filter(|ext| !ext.is_empty());

        let format = extension
            .as_deref()
            .map(ResourceFormat::from_extension)
            .unwrap_or(ResourceFormat::Unknown);

        let is_glob = [server, path]
            .iter()
            .any(|part| part.contains(['*', '?', '[']));

        Ok(Self {
            server: server.to_string(),
            path: path.to_string(),
            filename,
            extension,
            format,
            is_glob,
            query_params,
        })
    }

    pub fn is_valid(uri: &str) -> bool {
        Self::parse(uri).is_ok()
    }

    /// Builds a uri string, the inverse of [`McpUri::parse`] up to
    /// query-parameter ordering
    pub fn build(server: &str, path: &str, query_params: &[(String, String)]) -> String {
        let mut uri = format!(
            "{}{}{}{}",
            URI_SCHEME,
            server,
            if path.starts_with('/') || path.is_empty() {
                ""
            } else {
                "/"
            },
            path
        );

        if !query_params.is_empty() {
            uri.push('?');
            uri.push_str(
                &query_params
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&"),
            );
        }

        uri
    }

    pub fn to_uri_string(&self) -> String {
        Self::build(&self.server, &self.path, &self.query_params)
    }
}

/// Finds resource uris referenced by the query text.
///
/// Uris are recognized inside single/double/backtick-quoted string literals
/// and as bare arguments to the known reader functions. Duplicates are
/// removed, first occurrence order is preserved.
pub fn extract_from_sql(sql: &str) -> Vec<String> {
    let mut found = vec![];

    let mut chars = sql.char_indices();
    while let Some((idx, ch)) = chars.next() {
        if ch == '\'' || ch == '"' || ch == '`' {
            let start = idx + ch.len_utf8();
            let mut end = None;

            for (inner_idx, inner) in chars.by_ref() {
                if inner == ch {
                    end = Some(inner_idx);
                    break;
                }
            }

            if let Some(end) = end {
                let literal = &sql[start..end];
                if literal.starts_with(URI_SCHEME) {
                    found.push(literal.to_string());
                }
            }
        }
    }

    for caps in READER_ARG.captures_iter(sql) {
        found.push(caps[1].to_string());
    }

    let mut seen = std::collections::HashSet::new();
    found.retain(|uri| seen.insert(uri.clone()));
    found
}

/// Matches a glob pattern (`*`, `?`, `[...]`) against a string
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(pattern) => pattern.matches_with(
            text,
            glob::MatchOptions {
                case_sensitive: true,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        ),
        Err(_) => false,
    }
}

/// Expands a glob uri against the available resource uris.
///
/// Server and path patterns are matched independently. A non-glob uri
/// expands to itself unchanged.
pub fn expand_glob(uri: &str, available: &[String]) -> Result<Vec<String>> {
    let pattern = McpUri::parse(uri)?;

    if !pattern.is_glob {
        return Ok(vec![uri.to_string()]);
    }

    let mut matches = vec![];
    for candidate in available {
        let Ok(parsed) = McpUri::parse(candidate) else {
            continue;
        };

        if glob_match(&pattern.server, &parsed.server)
            && glob_match(&pattern.path, &parsed.path)
        {
            matches.push(candidate.clone());
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_uri() {
        let uri = McpUri::parse("mcp://api/users.json").unwrap();

        assert_eq!(uri.server, "api");
        assert_eq!(uri.path, "/users.json");
        assert_eq!(uri.filename.as_deref(), Some("users.json"));
        assert_eq!(uri.extension.as_deref(), Some("json"));
        assert_eq!(uri.format, ResourceFormat::Json);
        assert!(!uri.is_glob);
    }

    #[test]
    fn test_parse_nested_path_and_query() {
        let uri = McpUri::parse("mcp://warehouse/sales/2024/q1.parquet?region=eu&fresh=1").unwrap();

        assert_eq!(uri.server, "warehouse");
        assert_eq!(uri.path, "/sales/2024/q1.parquet");
        assert_eq!(uri.format, ResourceFormat::Parquet);
        assert_eq!(
            uri.query_params,
            vec![
                ("region".to_string(), "eu".to_string()),
                ("fresh".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(McpUri::parse("http://api/users.json").is_err());
        assert!(McpUri::parse("mcp:///users.json").is_err());
        assert!(McpUri::parse("mcp://").is_err());

        assert!(!McpUri::is_valid("users.json"));
        assert!(McpUri::is_valid("mcp://api/users.json"));
    }

    #[test]
    fn test_parse_preserves_server_case() {
        let uri = McpUri::parse("mcp://MyApi/Data.CSV").unwrap();

        assert_eq!(uri.server, "MyApi");
        // extension matching is case-insensitive
        assert_eq!(uri.format, ResourceFormat::Csv);
    }

    #[test]
    fn test_glob_detection() {
        assert!(McpUri::parse("mcp://api/logs/*.json").unwrap().is_glob);
        assert!(McpUri::parse("mcp://*/users.json").unwrap().is_glob);
        assert!(McpUri::parse("mcp://api/file-[0-9].csv").unwrap().is_glob);
        assert!(!McpUri::parse("mcp://api/users.json").unwrap().is_glob);
    }

    #[test]
    fn test_build_parse_round_trip() {
        let uris = [
            "mcp://api/users.json",
            "mcp://warehouse/sales/2024/q1.parquet?region=eu",
            "mcp://s1/logs/*.json",
        ];

        for uri in uris {
            let parsed = McpUri::parse(uri).unwrap();
            assert_eq!(parsed.to_uri_string(), uri);
        }
    }

    #[test]
    fn test_extract_from_sql_quoted() {
        let sql = r#"SELECT * FROM 'mcp://api/users.json' u JOIN "mcp://api/orders.csv" o ON u.id = o.uid"#;

        assert_eq!(
            extract_from_sql(sql),
            vec![
                "mcp://api/users.json".to_string(),
                "mcp://api/orders.csv".to_string()
            ]
        );
    }

    #[test]
    fn test_extract_from_sql_reader_function() {
        let sql = "SELECT * FROM read_parquet(mcp://lake/t.parquet) WHERE x > 1";

        assert_eq!(extract_from_sql(sql), vec!["mcp://lake/t.parquet".to_string()]);
    }

    #[test]
    fn test_extract_from_sql_dedups() {
        let sql = "SELECT * FROM 'mcp://a/x.json' UNION ALL SELECT * FROM 'mcp://a/x.json'";

        assert_eq!(extract_from_sql(sql).len(), 1);
    }

    #[test]
    fn test_glob_match_classes() {
        assert!(glob_match("logs/*.json", "logs/2024-01.json"));
        assert!(glob_match("file-?.csv", "file-1.csv"));
        assert!(glob_match("file-[0-9].csv", "file-7.csv"));
        assert!(!glob_match("file-[0-9].csv", "file-x.csv"));
    }

    #[test]
    fn test_expand_glob_matches_server_and_path() {
        let available = vec![
            "mcp://s1/logs/2024-01.json".to_string(),
            "mcp://s1/logs/2024-02.json".to_string(),
            "mcp://s2/logs/2024-01.json".to_string(),
        ];

        let expanded = expand_glob("mcp://s1/logs/*.json", &available).unwrap();
        assert_eq!(
            expanded,
            vec![
                "mcp://s1/logs/2024-01.json".to_string(),
                "mcp://s1/logs/2024-02.json".to_string()
            ]
        );

        let all = expand_glob("mcp://*/logs/2024-01.json", &available).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_expand_glob_non_glob_passthrough() {
        let expanded = expand_glob("mcp://a/data.json", &[]).unwrap();
        assert_eq!(expanded, vec!["mcp://a/data.json".to_string()]);
    }

    #[test]
    fn test_extract_from_sql_backtick_quoted() {
        let sql = "SELECT * FROM `mcp://api/data.csv`";
        assert_eq!(extract_from_sql(sql), vec!["mcp://api/data.csv".to_string()]);
    }

    #[test]
    fn test_parse_rejects_backslash_in_server() {
        assert!(McpUri::parse(r"mcp://bad\server/x.json").is_err());
    }

    #[test]
    fn test_parse_server_only_uri() {
        let uri = McpUri::parse("mcp://api").unwrap();
        assert_eq!(uri.server, "api");
        assert_eq!(uri.path, "");
        assert_eq!(uri.filename, None);
        assert_eq!(uri.format, ResourceFormat::Unknown);
    }

    #[test]
    fn test_query_params_without_value() {
        let uri = McpUri::parse("mcp://api/x.json?fresh").unwrap();
        assert_eq!(uri.query_params, vec![("fresh".to_string(), String::new())]);
    }
}
