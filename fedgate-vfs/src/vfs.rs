//! The virtual filesystem: orchestrates uri parsing, the registry, the
//! session pool, format detection, and the cache into a single resolution
//! pipeline, and preprocesses queries against it.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use fedgate_core::{
    config::{ProviderConfig, VfsConfig},
    data::{RemotePayload, ResourceFormat},
    err::{Context, GatewayError, Result},
};
use fedgate_logging::{debug, info, warn};
use fedgate_pool::SessionPool;
use fedgate_transport::Transport;
use futures::{future::Shared, Future, FutureExt};
use serde::Serialize;

use crate::{
    cache::{CacheStats, ResourceCache},
    format, preprocess,
    registry::{RegistryStats, ResourceRegistry},
    uri::{self, McpUri},
};

/// A resolved resource: the uri now backed by a local file
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    pub uri: String,
    pub local_path: PathBuf,
    pub format: ResourceFormat,
    /// Whether the resolution was served from cache
    pub cached: bool,
    pub server: String,
}

/// VFS observability counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VfsStats {
    pub total_resolutions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub connected_servers: Vec<String>,
    pub cache: CacheStats,
    pub registry: RegistryStats,
}

type ResolveFuture =
    Shared<Pin<Box<dyn Future<Output = Option<ResolvedResource>> + Send>>>;

/// The virtual filesystem. Cloning shares the same state.
#[derive(Clone)]
pub struct Vfs {
    inner: Arc<VfsInner>,
}

struct VfsInner {
    conf: VfsConfig,
    providers: Vec<ProviderConfig>,
    cache: ResourceCache,
    registry: Arc<ResourceRegistry>,
    pool: SessionPool,
    /// In-flight resolutions; concurrent callers for a uri share one fetch
    inflight: Mutex<HashMap<String, ResolveFuture>>,
    connected: Mutex<HashSet<String>>,
    total_resolutions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    errors: AtomicU64,
}

impl Vfs {
    pub fn new(
        conf: VfsConfig,
        providers: Vec<ProviderConfig>,
        cache: ResourceCache,
        registry: Arc<ResourceRegistry>,
        pool: SessionPool,
    ) -> Self {
        Self {
            inner: Arc::new(VfsInner {
                conf,
                providers,
                cache,
                registry,
                pool,
                inflight: Mutex::new(HashMap::new()),
                connected: Mutex::new(HashSet::new()),
                total_resolutions: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    /// Preprocesses a query: expands glob uris over the registered
    /// resources, then rewrites every remaining uri to a reader over its
    /// local file.
    pub async fn process_query(&self, sql: &str) -> Result<String> {
        let uris = uri::extract_from_sql(sql);

        let has_globs = uris
            .iter()
            .any(|u| McpUri::parse(u).map(|p| p.is_glob).unwrap_or(false));

        let sql = if has_globs {
            let available: Vec<String> = self
                .inner
                .registry
                .all_resources()
                .into_iter()
                .map(|r| r.full_uri)
                .collect();

            // resolve every concrete target of every glob up front
            let mut targets = vec![];
            for glob in &uris {
                let parsed = McpUri::parse(glob)?;
                if parsed.is_glob {
                    targets.extend(uri::expand_glob(glob, &available)?);
                }
            }

            let resolved = self.resolve_local_paths(&targets).await?;
            preprocess::expand_globs(sql, &available, |u| resolved.get(u).cloned())?
        } else {
            sql.to_string()
        };

        let remaining = uri::extract_from_sql(&sql);
        let resolved = self.resolve_local_paths(&remaining).await?;

        let transformed = preprocess::transform(&sql, |u| resolved.get(u).cloned())?;
        Ok(transformed.transformed_query)
    }

    /// Resolves the uris in parallel into a uri -> local path map,
    /// leaving failures out so the preprocessor reports them
    async fn resolve_local_paths(&self, uris: &[String]) -> Result<HashMap<String, String>> {
        let results = self.resolve_multiple(uris).await;

        Ok(uris
            .iter()
            .cloned()
            .zip(results)
            .filter_map(|(uri, resolved)| {
                resolved.map(|r| (uri, r.local_path.to_string_lossy().into_owned()))
            })
            .collect())
    }

    /// Resolves a uri to a local file, fetching and caching on a miss.
    ///
    /// Concurrent calls for the same uri share one underlying fetch and
    /// observe the identical result. Fetch and cache failures resolve to
    /// `None`; only a malformed uri is an error.
    pub async fn resolve_uri(&self, uri_str: &str) -> Result<Option<ResolvedResource>> {
        let parsed = McpUri::parse(uri_str)?;
        self.inner.total_resolutions.fetch_add(1, Ordering::Relaxed);

        let fut = {
            let mut inflight = self.inner.inflight.lock().unwrap();

            match inflight.get(uri_str) {
                Some(fut) => fut.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let uri_owned = uri_str.to_string();
                    let fut: ResolveFuture = async move {
                        inner.do_resolve(parsed, uri_owned).await
                    }
                    .boxed()
                    .shared();

                    inflight.insert(uri_str.to_string(), fut.clone());
                    fut
                }
            }
        };

        let resolved = fut.await;
        self.inner.inflight.lock().unwrap().remove(uri_str);

        Ok(resolved)
    }

    /// Resolves several uris in parallel; per-uri failures yield `None`
    pub async fn resolve_multiple(&self, uris: &[String]) -> Vec<Option<ResolvedResource>> {
        futures::future::join_all(uris.iter().map(|uri| async move {
            match self.resolve_uri(uri).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!("Failed to resolve '{}': {:?}", uri, err);
                    None
                }
            }
        }))
        .await
    }

    /// Warms the cache for a uri
    pub async fn precache_resource(&self, uri: &str) -> Result<Option<ResolvedResource>> {
        self.resolve_uri(uri).await
    }

    /// Connects to the named server, trying the configured endpoint and the
    /// discovery patterns in order until a resource listing succeeds.
    pub async fn connect_to_server(&self, alias: &str) -> Result<()> {
        self.inner.connect(alias).await
    }

    /// Expands a glob uri against the registry; a non-glob uri expands to
    /// itself
    pub fn expand_glob(&self, uri_str: &str) -> Result<Vec<String>> {
        let parsed = McpUri::parse(uri_str)?;

        if !parsed.is_glob {
            return Ok(vec![uri_str.to_string()]);
        }

        Ok(self
            .inner
            .registry
            .resolve_glob(uri_str)
            .into_iter()
            .map(|r| r.full_uri)
            .collect())
    }

    pub fn search_resources(&self, pattern: &str) -> Vec<crate::registry::FederatedResource> {
        self.inner.registry.search(pattern)
    }

    pub fn list_available_resources(&self) -> Vec<crate::registry::FederatedResource> {
        self.inner.registry.all_resources()
    }

    /// Whether the uri is known to the registry or already cached
    pub fn is_available(&self, uri: &str) -> bool {
        self.inner.registry.resolve(uri).is_some()
            || self.inner.cache.get_cached_path(uri).is_some()
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.inner.cache.clear_cache()
    }

    pub fn connected_servers(&self) -> Vec<String> {
        let mut servers: Vec<_> = self
            .inner
            .connected
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        servers.sort();
        servers
    }

    pub fn stats(&self) -> VfsStats {
        VfsStats {
            total_resolutions: self.inner.total_resolutions.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            connected_servers: self.connected_servers(),
            cache: self.inner.cache.stats(),
            registry: self.inner.registry.stats(),
        }
    }
}

impl VfsInner {
    /// The resolution pipeline for one uri; runs at most once per in-flight
    /// window
    async fn do_resolve(
        self: Arc<Self>,
        parsed: McpUri,
        uri: String,
    ) -> Option<ResolvedResource> {
        if let Some(local_path) = self.cache.get_cached_path(&uri) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);

            let format = if parsed.format != ResourceFormat::Unknown {
                parsed.format
            } else {
                local_path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(ResourceFormat::from_extension)
                    .unwrap_or(ResourceFormat::Unknown)
            };

            return Some(ResolvedResource {
                uri,
                local_path,
                format,
                cached: true,
                server: parsed.server,
            });
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.fetch_and_cache(&parsed, &uri).await {
            Ok(resolved) => Some(resolved),
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to resolve '{}': {:?}", uri, err);
                None
            }
        }
    }

    async fn fetch_and_cache(&self, parsed: &McpUri, uri: &str) -> Result<ResolvedResource> {
        let mut resource = self.registry.resolve(uri);

        if resource.is_none() && self.conf.auto_connect {
            self.connect(&parsed.server).await?;
            resource = self.registry.resolve(uri);
        }

        let resource =
            resource.ok_or_else(|| GatewayError::UnresolvedUri(uri.to_string()))?;

        let endpoint = self
            .registry
            .endpoint(&resource.server_alias)
            .ok_or_else(|| GatewayError::CannotResolveServer(resource.server_alias.clone()))?;

        let transport = self
            .providers
            .iter()
            .find(|p| p.id == resource.server_alias)
            .and_then(|p| p.transport.as_deref())
            .map(str::parse)
            .transpose()?
            .unwrap_or(Transport::Auto);

        let client = self.pool.get_session(&endpoint, transport).await?;
        let raw = client
            .read_resource(&resource.uri)
            .await
            .with_context(|| format!("Failed to read '{}'", resource.uri))?;

        let payload = RemotePayload::decode(&raw)?;

        // the uri's extension wins; the detector only sees extension-less
        // payloads
        let format = if parsed.format != ResourceFormat::Unknown {
            parsed.format
        } else {
            match &payload {
                RemotePayload::Text(text) => format::detect_from_content(text.as_bytes()),
                RemotePayload::Blob(bytes) => format::detect_from_content(bytes),
                RemotePayload::Rows(_) => ResourceFormat::Json,
                RemotePayload::Unknown => ResourceFormat::Unknown,
            }
        };

        let local_path = match &payload {
            RemotePayload::Text(text) => self.cache.cache_text(uri, text, format, None)?,
            RemotePayload::Blob(bytes) => {
                self.cache.cache_resource(uri, bytes, format, None)?
            }
            RemotePayload::Rows(rows) => self.cache.cache_rows(uri, rows, None)?,
            RemotePayload::Unknown => {
                return Err(GatewayError::UnsupportedRemoteData(
                    resource.server_alias.clone(),
                )
                .into())
            }
        };

        let format = match payload {
            RemotePayload::Rows(_) => ResourceFormat::Json,
            _ => format,
        };

        self.registry.mark_cached(uri);

        Ok(ResolvedResource {
            uri: uri.to_string(),
            local_path,
            format,
            cached: false,
            server: resource.server_alias,
        })
    }

    /// Tries each candidate endpoint for the alias until `list_resources`
    /// succeeds, then registers the returned resources
    async fn connect(&self, alias: &str) -> Result<()> {
        if self.connected.lock().unwrap().contains(alias) {
            return Ok(());
        }

        let mut candidates: Vec<(String, Transport)> = vec![];

        if let Some(provider) = self.providers.iter().find(|p| p.id == alias) {
            let transport = provider
                .transport
                .as_deref()
                .map(str::parse)
                .transpose()
                .with_context(|| format!("Bad transport for provider '{alias}'"))?
                .unwrap_or(Transport::Auto);
            candidates.push((provider.url.clone(), transport));
        }

        if self.conf.auto_discovery {
            for pattern in &self.conf.connection_patterns {
                candidates.push((pattern.replace("{serverName}", alias), Transport::Auto));
            }
        }

        for (url, transport) in candidates {
            let client = match self.pool.get_session(&url, transport).await {
                Ok(client) => client,
                Err(err) => {
                    debug!("Endpoint '{}' for '{}' unreachable: {}", url, alias, err);
                    continue;
                }
            };

            match client.list_resources().await {
                Ok(resources) => {
                    info!(
                        "Connected to server '{}' at '{}' ({} resources)",
                        alias,
                        url,
                        resources.len()
                    );
                    self.registry.register(alias, &url, resources);
                    self.connected.lock().unwrap().insert(alias.to_string());
                    return Ok(());
                }
                Err(err) => {
                    warn!("Endpoint '{}' for '{}' rejected listing: {}", url, alias, err);
                }
            }
        }

        Err(GatewayError::CannotResolveServer(alias.to_string()).into())
    }
}
