//! The query router: detects federation, fetches remote data in parallel,
//! materializes it as temp tables, rewrites the query, runs it on the
//! engine, and cleans up.

mod plan;
pub use plan::*;

use std::{
    collections::BTreeSet,
    fs,
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context as TaskContext, Poll},
    time::Instant,
};

use fedgate_core::{
    config::RouterConfig,
    data::{DataValue, QueryRows, RemotePayload, ResourceFormat},
    err::{Context, GatewayError, Result},
};
use fedgate_engine::{quote_ident, DuckdbEngine};
use fedgate_logging::{abbrev, best_effort, debug};
use fedgate_pool::SessionPool;
use fedgate_transport::Transport;
use fedgate_vfs::{registry::ResourceRegistry, uri::McpUri};
use futures::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

static MCP_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)mcp://([A-Za-z0-9_\-]+)/([^\s'\x22`),]+)").unwrap());

static QUALIFIED_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:from|join)\s+([A-Za-z_][A-Za-z0-9_\-]*)\.([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap()
});

static ORDER_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\border\s+by\b").unwrap());
static WHERE_IN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bwhere\b.*\bin\s*\(").unwrap());

/// The query router
pub struct QueryRouter {
    engine: Arc<DuckdbEngine>,
    registry: Arc<ResourceRegistry>,
    pool: SessionPool,
    /// Tools matching this accept delegated queries
    query_tool: Regex,
    /// Longest rewritten query text echoed into debug logs
    log_query_chars: usize,
    temp_counter: AtomicU64,
    temp_tables_created: AtomicU64,
    queries_routed: AtomicU64,
}

/// A materialized stream of result rows
pub struct RowStream {
    pub columns: Vec<String>,
    inner: std::vec::IntoIter<Vec<DataValue>>,
}

impl Stream for RowStream {
    type Item = Vec<DataValue>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().inner.next())
    }
}

impl QueryRouter {
    pub fn new(
        conf: &RouterConfig,
        engine: Arc<DuckdbEngine>,
        registry: Arc<ResourceRegistry>,
        pool: SessionPool,
    ) -> Result<Self> {
        let query_tool = Regex::new(&conf.query_tool_matcher)
            .with_context(|| format!("Bad query tool matcher: '{}'", conf.query_tool_matcher))?;

        Ok(Self {
            engine,
            registry,
            pool,
            query_tool,
            log_query_chars: conf.log_query_chars,
            temp_counter: AtomicU64::new(0),
            temp_tables_created: AtomicU64::new(0),
            queries_routed: AtomicU64::new(0),
        })
    }

    /// Detects federation and produces the plan for a query.
    ///
    /// A query federates when it references a `mcp://` uri or a
    /// `<alias>.<table>` where the alias is a registered server. Server
    /// subqueries are synthetic full scans; the remote side is not planned.
    pub fn analyze_query(&self, sql: &str) -> QueryPlan {
        let known_servers: BTreeSet<String> = self.registry.servers().into_iter().collect();
        let mut remote_queries = std::collections::BTreeMap::new();

        for caps in MCP_REF.captures_iter(sql) {
            let server = caps[1].to_string();
            remote_queries
                .entry(server)
                .or_insert_with(|| format!("SELECT * FROM '{}'", &caps[2]));
        }

        for caps in QUALIFIED_REF.captures_iter(sql) {
            let alias = caps[1].to_string();
            if known_servers.contains(&alias) {
                remote_queries
                    .entry(alias)
                    .or_insert_with(|| format!("SELECT * FROM {}", &caps[2]));
            }
        }

        let requires_federation = !remote_queries.is_empty();

        let join_strategy = if requires_federation {
            Some(if ORDER_BY.is_match(sql) {
                JoinStrategy::Merge
            } else if WHERE_IN.is_match(sql) {
                JoinStrategy::Nested
            } else {
                JoinStrategy::Hash
            })
        } else {
            None
        };

        QueryPlan {
            requires_federation,
            local_query: sql.to_string(),
            remote_queries,
            join_strategy,
        }
    }

    /// Executes a query, federating over remote sources where referenced
    pub async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        let started = Instant::now();
        self.queries_routed.fetch_add(1, Ordering::Relaxed);

        let plan = self.analyze_query(sql);

        if !plan.requires_federation {
            let rows = self.engine.execute(sql)?;
            return Ok(Self::result(rows, started, vec!["local".into()]));
        }

        debug!(
            "Federating over {} sources: {:?}",
            plan.remote_queries.len(),
            plan.remote_queries.keys().collect::<Vec<_>>()
        );

        // fetch every referenced server in parallel
        let fetches = futures::future::join_all(plan.remote_queries.iter().map(
            |(alias, subquery)| async move {
                (alias.clone(), self.fetch_remote(alias, subquery).await)
            },
        ))
        .await;

        let mut payloads = vec![];
        for (alias, fetched) in fetches {
            payloads.push((alias, fetched?));
        }

        // materialize each payload as a temp table
        let mut temp_tables: Vec<(String, String)> = vec![];
        let mut temp_files: Vec<PathBuf> = vec![];

        for (alias, payload) in payloads {
            let table = format!(
                "temp_{}_{}",
                alias,
                self.temp_counter.fetch_add(1, Ordering::Relaxed) + 1
            );

            if let Err(err) = self.materialize(&table, &alias, payload, &mut temp_files) {
                self.cleanup(&temp_tables, &temp_files);
                return Err(err);
            }

            self.temp_tables_created.fetch_add(1, Ordering::Relaxed);
            temp_tables.push((alias, table));
        }

        let rewritten = Self::rewrite(sql, &temp_tables);
        debug!(
            "Executing rewritten query: {}",
            abbrev(&rewritten, self.log_query_chars)
        );

        let executed = self.engine.execute(&rewritten);
        self.cleanup(&temp_tables, &temp_files);
        let rows = executed?;

        let mut sources = vec!["local".to_string()];
        sources.extend(plan.remote_queries.keys().cloned());

        Ok(Self::result(rows, started, sources))
    }

    /// Executes a query and streams its rows.
    /// Federated queries materialize first; the stream is over the fetched
    /// result set.
    pub async fn execute_query_stream(&self, sql: &str) -> Result<RowStream> {
        let result = self.execute_query(sql).await?;

        Ok(RowStream {
            columns: result.rows.columns,
            inner: result.rows.rows.into_iter(),
        })
    }

    /// Renders the plan for a query as a human-readable string
    pub async fn explain_query(&self, sql: &str) -> Result<String> {
        let plan = self.analyze_query(sql);

        let mut out = String::from("Query Plan\n");
        out.push_str(&format!(
            "  federation: {}\n",
            if plan.requires_federation { "yes" } else { "no" }
        ));

        if let Some(strategy) = plan.join_strategy {
            out.push_str(&format!("  join strategy: {:?}\n", strategy));
        }

        if !plan.remote_queries.is_empty() {
            out.push_str("  remote sources:\n");
            for (alias, subquery) in &plan.remote_queries {
                out.push_str(&format!("    {}: {}\n", alias, subquery));
            }
        }

        out.push_str(&format!("  local query: {}\n", plan.local_query));
        Ok(out)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            temp_tables_created: self.temp_tables_created.load(Ordering::Relaxed),
            queries_routed: self.queries_routed.load(Ordering::Relaxed),
        }
    }

    fn result(rows: QueryRows, started: Instant, sources: Vec<String>) -> QueryResult {
        QueryResult {
            metadata: QueryMetadata {
                row_count: rows.len(),
                execution_time_ms: started.elapsed().as_millis() as u64,
                sources_queried: sources,
            },
            rows,
        }
    }

    /// Fetches data for one server alias.
    ///
    /// When the provider advertises a query-capable tool the subquery is
    /// delegated to it; otherwise the server's first registered resource is
    /// read. Text payloads that parse as JSON become rows.
    async fn fetch_remote(&self, alias: &str, subquery: &str) -> Result<RemotePayload> {
        let fetch_failed = |cause: &dyn std::fmt::Display| GatewayError::RemoteFetchFailed {
            server: alias.to_string(),
            cause: cause.to_string(),
        };

        let endpoint = self
            .registry
            .endpoint(alias)
            .ok_or_else(|| GatewayError::CannotResolveServer(alias.to_string()))?;

        let client = self
            .pool
            .get_session(&endpoint, Transport::Auto)
            .await
            .map_err(|e| fetch_failed(&e))?;

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                debug!("Server '{}' offers no tool listing: {}", alias, err);
                vec![]
            }
        };

        if let Some(tool) = tools.iter().find(|t| self.query_tool.is_match(&t.name)) {
            debug!("Delegating subquery to tool '{}' on '{}'", tool.name, alias);

            let content = client
                .call_tool(&tool.name, json!({ "query": subquery, "sql": subquery }))
                .await
                .map_err(|e| fetch_failed(&e))?;

            let payload = RemotePayload::decode(&content).map_err(|e| fetch_failed(&e))?;
            return Ok(Self::rows_from_text_payload(payload));
        }

        let resources = self.registry.server_resources(alias);
        let first = resources
            .first()
            .ok_or_else(|| GatewayError::NoResourcesForServer(alias.to_string()))?;

        let raw = client
            .read_resource(&first.uri)
            .await
            .map_err(|e| fetch_failed(&e))?;

        let payload = RemotePayload::decode(&raw).map_err(|e| fetch_failed(&e))?;
        Ok(Self::rows_from_text_payload(payload))
    }

    fn rows_from_text_payload(payload: RemotePayload) -> RemotePayload {
        match payload {
            RemotePayload::Text(text) => match RemotePayload::rows_from_text(&text) {
                Some(rows) => RemotePayload::Rows(rows),
                None => RemotePayload::Text(text),
            },
            other => other,
        }
    }

    /// Materializes one payload as a temp table, tracking any scratch file
    fn materialize(
        &self,
        table: &str,
        alias: &str,
        payload: RemotePayload,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<()> {
        match payload {
            RemotePayload::Rows(rows) => self.engine.create_table_from_rows(table, &rows),
            RemotePayload::Text(text) => {
                let path = Self::scratch_file("csv");
                fs::write(&path, text.as_bytes())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                temp_files.push(path.clone());

                self.engine
                    .create_temp_table_from_file(table, &path, ResourceFormat::Csv)
            }
            RemotePayload::Blob(bytes) => {
                let path = Self::scratch_file("parquet");
                fs::write(&path, bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                temp_files.push(path.clone());

                self.engine
                    .create_temp_table_from_file(table, &path, ResourceFormat::Parquet)
            }
            RemotePayload::Unknown => {
                Err(GatewayError::UnsupportedRemoteData(alias.to_string()).into())
            }
        }
    }

    fn scratch_file(extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fedgate_{}.{}", uuid::Uuid::new_v4(), extension))
    }

    /// Rewrites `mcp://<alias>/...` references and `FROM/JOIN
    /// <alias>.<table>` references to the materialized temp tables.
    /// Column references like `<alias>.<column>` are left alone so table
    /// aliases in the original query keep working.
    fn rewrite(sql: &str, temp_tables: &[(String, String)]) -> String {
        let mut out = sql.to_string();

        for (alias, table) in temp_tables {
            let ident = quote_ident(table);
            let escaped = regex::escape(alias);

            let quoted_uri =
                Regex::new(&format!(r#"['\x22`](?i:mcp)://{escaped}/[^'\x22`]*['\x22`]"#))
                    .unwrap();
            out = quoted_uri
                .replace_all(&out, regex::NoExpand(&ident))
                .into_owned();

            let bare_uri =
                Regex::new(&format!(r#"(?i:mcp)://{escaped}/[^\s'\x22`),]*"#)).unwrap();
            out = bare_uri
                .replace_all(&out, regex::NoExpand(&ident))
                .into_owned();

            let table_ref = Regex::new(&format!(
                r#"(?i)\b(from|join)\s+{escaped}\.[A-Za-z_][A-Za-z0-9_]*"#
            ))
            .unwrap();
            out = table_ref
                .replace_all(&out, |caps: &regex::Captures| {
                    format!("{} {}", &caps[1], ident)
                })
                .into_owned();
        }

        out
    }

    /// Best-effort teardown of temp tables and scratch files
    fn cleanup(&self, temp_tables: &[(String, String)], temp_files: &[PathBuf]) {
        for (_, table) in temp_tables {
            best_effort(
                &format!("Failed to drop temp table '{table}'"),
                self.engine.drop_table(table),
            );
        }

        for path in temp_files {
            best_effort(
                &format!("Failed to remove scratch file '{}'", path.display()),
                fs::remove_file(path).map_err(fedgate_core::err::Error::from),
            );
        }
    }
}

/// Whether a uri belongs to the alias, for tests and diagnostics
pub fn uri_references_server(uri: &str, alias: &str) -> bool {
    McpUri::parse(uri)
        .map(|parsed| parsed.server == alias)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_quoted_uri_and_keeps_column_refs() {
        let sql = "SELECT a.v, b.w FROM 'mcp://a/data.json' a JOIN 'mcp://b/data.json' b ON a.id=b.id";
        let rewritten = QueryRouter::rewrite(
            sql,
            &[
                ("a".to_string(), "temp_a_1".to_string()),
                ("b".to_string(), "temp_b_2".to_string()),
            ],
        );

        assert_eq!(
            rewritten,
            "SELECT a.v, b.w FROM \"temp_a_1\" a JOIN \"temp_b_2\" b ON a.id=b.id"
        );
    }

    #[test]
    fn test_rewrite_table_reference() {
        let sql = "SELECT * FROM api.users WHERE x = 1";
        let rewritten =
            QueryRouter::rewrite(sql, &[("api".to_string(), "temp_api_1".to_string())]);

        assert_eq!(rewritten, "SELECT * FROM \"temp_api_1\" WHERE x = 1");
    }

    #[test]
    fn test_rewrite_case_insensitive_scheme_preserves_alias_case() {
        let sql = "SELECT * FROM 'MCP://api/users.json'";
        let rewritten =
            QueryRouter::rewrite(sql, &[("api".to_string(), "temp_api_1".to_string())]);

        assert_eq!(rewritten, "SELECT * FROM \"temp_api_1\"");

        // a different-cased alias is a different server
        let sql = "SELECT * FROM 'mcp://API/users.json'";
        let rewritten =
            QueryRouter::rewrite(sql, &[("api".to_string(), "temp_api_1".to_string())]);
        assert!(rewritten.contains("API"));
    }

    #[test]
    fn test_uri_references_server() {
        assert!(uri_references_server("mcp://api/users.json", "api"));
        assert!(!uri_references_server("mcp://other/users.json", "api"));
        assert!(!uri_references_server("not a uri", "api"));
    }
}
