use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Top-level configuration for a gateway node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// The remote resource providers known to this node
    pub providers: Vec<ProviderConfig>,
    /// Resource cache settings
    pub cache: CacheConfig,
    /// Session pool settings
    pub pool: PoolConfig,
    /// Virtual filesystem settings
    pub vfs: VfsConfig,
    /// Analytical engine settings
    pub engine: EngineConfig,
    /// Query router settings
    pub router: RouterConfig,
}

/// A configured remote resource provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// The local alias the provider's resources are namespaced under
    pub id: String,
    /// The provider endpoint url
    pub url: String,
    /// Optional explicit transport, one of stdio/http/websocket/tcp.
    /// When absent the transport is inferred from the url scheme.
    #[serde(default)]
    pub transport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cached resource files and cache metadata
    pub cache_dir: PathBuf,
    /// Default time-to-live for cached entries in milliseconds
    pub default_ttl_ms: u64,
    /// Upper bound of the summed size of all cached files in bytes
    pub max_size_bytes: u64,
    /// Upper bound of the number of cached entries
    pub max_items: usize,
    /// Interval of the background expiry sweep in milliseconds
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("fedgate-cache"),
            default_ttl_ms: 300_000,
            max_size_bytes: 1024 * 1024 * 1024,
            max_items: 1_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of pooled sessions across all providers
    pub max_connections: usize,
    /// Maximum lifetime of a pooled session in milliseconds
    pub connection_ttl_ms: u64,
    /// Idle sessions older than this are evicted, in milliseconds
    pub idle_timeout_ms: u64,
    /// Interval of the background health probe in milliseconds
    pub health_check_interval_ms: u64,
    /// Number of attempts when opening a session
    pub retry_attempts: usize,
    /// Delay between open attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            connection_ttl_ms: 3_600_000,
            idle_timeout_ms: 600_000,
            health_check_interval_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl PoolConfig {
    pub fn connection_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_ttl_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Whether resolution may connect to not-yet-registered servers
    pub auto_connect: bool,
    /// Whether connection patterns are tried for unknown server aliases
    pub auto_discovery: bool,
    /// Endpoint templates tried in order by auto discovery.
    /// `{serverName}` is replaced with the server alias.
    pub connection_patterns: Vec<String>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_discovery: false,
            connection_patterns: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the engine database file, in-memory when absent
    pub database: Option<PathBuf>,
    /// Engine memory limit, e.g. "4GB"
    pub memory_limit: Option<String>,
    /// Engine worker thread count
    pub threads: Option<u64>,
    /// Object store credentials applied to the engine session
    pub object_store: Option<ObjectStoreConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: None,
            memory_limit: None,
            threads: None,
            object_store: None,
        }
    }
}

/// S3-style object store credentials for the engine's remote readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Pattern deciding whether a provider tool accepts delegated queries
    pub query_tool_matcher: String,
    /// Longest rewritten query text echoed into debug logs, in characters
    pub log_query_chars: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            query_tool_matcher: "(?i)(query|sql)".into(),
            log_query_chars: 500,
        }
    }
}
