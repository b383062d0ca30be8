//! Shared fixtures for the end-to-end suites: a fully wired gateway stack
//! with in-process providers standing in for remote servers.

use std::sync::Arc;

use fedgate_core::config::{CacheConfig, PoolConfig, ProviderConfig, RouterConfig, VfsConfig};
use fedgate_engine::DuckdbEngine;
use fedgate_pool::SessionPool;
use fedgate_router::QueryRouter;
use fedgate_transport::{
    memory::{MemoryProvider, MemorySessionFactory},
    proto::ResourceDescriptor,
};
use fedgate_vfs::{cache::ResourceCache, registry::ResourceRegistry, Vfs};
use tempfile::TempDir;

/// A fully wired gateway stack backed by in-process providers
pub struct TestStack {
    pub engine: Arc<DuckdbEngine>,
    pub cache: ResourceCache,
    pub registry: Arc<ResourceRegistry>,
    pub pool: SessionPool,
    pub vfs: Vfs,
    pub router: QueryRouter,
    pub factory: Arc<MemorySessionFactory>,
    _cache_dir: TempDir,
}

/// Wires up engine, cache, registry, pool, vfs, and router against the
/// supplied provider configs
pub fn stack(providers: Vec<ProviderConfig>) -> TestStack {
    fedgate_logging::init_for_tests();

    let cache_dir = TempDir::new().unwrap();
    let cache = ResourceCache::new(CacheConfig {
        cache_dir: cache_dir.path().to_path_buf(),
        ..CacheConfig::default()
    })
    .unwrap();

    let engine = Arc::new(DuckdbEngine::new(&Default::default()).unwrap());
    let registry = Arc::new(ResourceRegistry::new());
    let factory = MemorySessionFactory::new();
    let pool = SessionPool::new(
        PoolConfig {
            retry_delay_ms: 10,
            ..PoolConfig::default()
        },
        factory.clone(),
    );

    let vfs = Vfs::new(
        VfsConfig::default(),
        providers,
        cache.clone(),
        Arc::clone(&registry),
        pool.clone(),
    );

    let router = QueryRouter::new(
        &RouterConfig::default(),
        Arc::clone(&engine),
        Arc::clone(&registry),
        pool.clone(),
    )
    .unwrap();

    TestStack {
        engine,
        cache,
        registry,
        pool,
        vfs,
        router,
        factory,
        _cache_dir: cache_dir,
    }
}

pub fn provider_conf(id: &str) -> ProviderConfig {
    ProviderConfig {
        id: id.into(),
        url: provider_url(id),
        transport: None,
    }
}

pub fn provider_url(id: &str) -> String {
    format!("ws://{id}:9000")
}

/// Registers an in-process provider serving one text resource, both with
/// the session factory and the registry
pub fn serve_text(stack: &TestStack, alias: &str, uri: &str, text: &str) -> Arc<MemoryProvider> {
    serve_resources(stack, alias, &[(uri, text)])
}

/// Registers an in-process provider serving several text resources
pub fn serve_resources(
    stack: &TestStack,
    alias: &str,
    resources: &[(&str, &str)],
) -> Arc<MemoryProvider> {
    let provider = MemoryProvider::new();
    let mut descriptors = vec![];

    for (uri, text) in resources {
        provider.add_text_resource(uri, uri, text);
        descriptors.push(ResourceDescriptor::new(*uri, *uri));
    }

    let url = provider_url(alias);
    stack.factory.register(&url, provider.clone());
    stack.registry.register(alias, &url, descriptors);

    provider
}
