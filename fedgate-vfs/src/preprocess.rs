//! SQL-text rewriting: resource uris become engine reader fragments over
//! locally cached files.
//!
//! Rewriting is textual by design. Queries are not parsed; quoted uris are
//! replaced whole (quotes consumed) and bare uris inside reader-function
//! calls are replaced with the quoted local path so the surrounding reader
//! still applies.

use std::{collections::HashSet, path::Path};

use fedgate_core::{
    data::ResourceFormat,
    err::{Context, GatewayError, Result},
};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    format::build_read_query,
    uri::{expand_glob, extract_from_sql, McpUri},
};

/// One applied uri substitution
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub uri: String,
    pub local_path: String,
    /// The reader fragment substituted for quoted occurrences
    pub fragment: String,
}

/// The outcome of preprocessing a query
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedQuery {
    pub original_query: String,
    pub transformed_query: String,
    pub replacements: Vec<Replacement>,
    pub uris_to_resolve: Vec<String>,
}

static TABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:from|join)\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap()
});

static SQL_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "select", "from", "where", "join", "inner", "left", "right", "full", "outer", "cross",
        "on", "and", "or", "not", "as", "group", "order", "by", "having", "limit", "offset",
        "union", "all", "distinct", "with", "values", "insert", "into", "create", "table",
        "temp", "temporary", "view",
    ]
    .into_iter()
    .collect()
});

/// Infers the rewrite format for a uri, falling back to the local file's
/// extension when the uri itself does not carry one
fn rewrite_format(uri: &str, local_path: &str) -> ResourceFormat {
    let from_uri = McpUri::parse(uri)
        .map(|parsed| parsed.format)
        .unwrap_or(ResourceFormat::Unknown);

    if from_uri != ResourceFormat::Unknown {
        return from_uri;
    }

    Path::new(local_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(ResourceFormat::from_extension)
        .unwrap_or(ResourceFormat::Unknown)
}

fn quoted_path(path: &str) -> String {
    format!("'{}'", path.replace('\'', "''"))
}

/// Substitutes one uri: quoted occurrences become `fragment`, remaining bare
/// occurrences become `bare`
fn substitute(sql: &str, uri: &str, fragment: &str, bare: &str) -> String {
    let mut out = sql.to_string();

    for quote in ['\'', '"', '`'] {
        let quoted = format!("{quote}{uri}{quote}");
        out = out.replace(&quoted, fragment);
    }

    out.replace(uri, bare)
}

/// Rewrites every resolvable uri in the query to a reader fragment.
///
/// The resolver maps a uri to a local path; `None` for a `mcp://` uri
/// propagates as [`GatewayError::UnresolvedUri`].
pub fn transform<F>(sql: &str, resolver: F) -> Result<TransformedQuery>
where
    F: Fn(&str) -> Option<String>,
{
    let uris = extract_from_sql(sql);

    // longest first so a uri that prefixes another is never clobbered
    let mut ordered = uris.clone();
    ordered.sort_by_key(|uri| std::cmp::Reverse(uri.len()));

    let mut transformed = sql.to_string();
    let mut replacements = vec![];

    for uri in &ordered {
        let local_path = resolver(uri)
            .ok_or_else(|| GatewayError::UnresolvedUri(uri.clone()))
            .context("While preprocessing query")?;

        let fragment = build_read_query(&local_path, rewrite_format(uri, &local_path));
        transformed = substitute(&transformed, uri, &fragment, &quoted_path(&local_path));

        replacements.push(Replacement {
            uri: uri.clone(),
            local_path,
            fragment,
        });
    }

    Ok(TransformedQuery {
        original_query: sql.to_string(),
        transformed_query: transformed,
        replacements,
        uris_to_resolve: uris,
    })
}

/// Re-applies a set of replacements to a query text.
/// An empty list leaves the query untouched.
pub fn apply_replacements(sql: &str, replacements: &[Replacement]) -> String {
    let mut out = sql.to_string();

    for replacement in replacements {
        out = substitute(
            &out,
            &replacement.uri,
            &replacement.fragment,
            &quoted_path(&replacement.local_path),
        );
    }

    out
}

/// A preprocessed query must still look like SQL and carry no residual uris
pub fn validate(sql: &str) -> bool {
    let upper = sql.to_uppercase();

    let has_statement = ["SELECT", "CREATE", "INSERT"]
        .iter()
        .any(|kw| upper.contains(kw));

    has_statement && !upper.contains("MCP://")
}

/// Expands glob uris in the query to readers over the matching resources.
///
/// A glob matching one resource becomes a single reader; matching several
/// becomes a parenthesized `UNION ALL` of readers; matching none is an
/// input error.
pub fn expand_globs<F>(sql: &str, available: &[String], resolver: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = sql.to_string();

    for uri in extract_from_sql(sql) {
        let Ok(parsed) = McpUri::parse(&uri) else {
            continue;
        };
        if !parsed.is_glob {
            continue;
        }

        let expanded = expand_glob(&uri, available)?;
        if expanded.is_empty() {
            return Err(GatewayError::UnresolvedUri(uri.clone()))
                .with_context(|| format!("Glob '{uri}' matched no resources"));
        }

        let fragments = expanded
            .iter()
            .map(|concrete| {
                let local_path = resolver(concrete)
                    .ok_or_else(|| GatewayError::UnresolvedUri(concrete.clone()))?;
                Ok(build_read_query(
                    &local_path,
                    rewrite_format(concrete, &local_path),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let replacement = if fragments.len() == 1 {
            fragments[0].clone()
        } else {
            // each branch must be a full select for the union to parse
            let selects: Vec<String> = fragments
                .iter()
                .map(|fragment| format!("SELECT * FROM {fragment}"))
                .collect();
            format!("({})", selects.join(" UNION ALL "))
        };

        out = substitute(&out, &uri, &replacement, &replacement);
    }

    Ok(out)
}

/// Extracts bare table names referenced after FROM/JOIN, keywords filtered
pub fn extract_table_references(sql: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tables = vec![];

    for caps in TABLE_REF.captures_iter(sql) {
        let name = caps[1].to_string();

        if SQL_KEYWORDS.contains(name.to_ascii_lowercase().as_str()) {
            continue;
        }
        if name.to_ascii_lowercase().starts_with("read_") {
            continue;
        }

        if seen.insert(name.clone()) {
            tables.push(name);
        }
    }

    tables
}
