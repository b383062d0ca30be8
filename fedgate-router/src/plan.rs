use std::collections::BTreeMap;

use fedgate_core::data::QueryRows;
use serde::Serialize;

/// How a federated join will be evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    Hash,
    Merge,
    Nested,
}

/// The outcome of analyzing a query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Whether the query references remote sources
    pub requires_federation: bool,
    /// The query as it will run locally once remote data is materialized
    pub local_query: String,
    /// Synthetic per-server subqueries, keyed by server alias
    pub remote_queries: BTreeMap<String, String>,
    pub join_strategy: Option<JoinStrategy>,
}

/// Execution metadata returned alongside the rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetadata {
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub sources_queried: Vec<String>,
}

/// Rows plus execution metadata
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub rows: QueryRows,
    pub metadata: QueryMetadata,
}

/// Router observability counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStats {
    pub temp_tables_created: u64,
    pub queries_routed: u64,
}
