//! Namespaced catalog of the resources each provider exposes.

use std::{
    collections::{BTreeSet, HashMap},
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use fedgate_core::err::{bail, Context, Result};
use fedgate_logging::debug;
use fedgate_transport::proto::ResourceDescriptor;
use serde::{Deserialize, Serialize};

use crate::uri::{self, McpUri, URI_SCHEME};

const EXPORT_VERSION: u32 = 1;

/// A resource known to the registry, namespaced by its server alias
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedResource {
    pub server_alias: String,
    /// The provider-relative resource uri
    pub uri: String,
    /// `mcp://<alias>/<uri>`
    pub full_uri: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub cached: bool,
}

/// Registry observability counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_resources: usize,
    pub server_count: usize,
    pub cached_count: usize,
    pub servers: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    /// Primary index, keyed `alias:uri`
    resources: HashMap<String, FederatedResource>,
    /// Keys per alias
    by_server: HashMap<String, BTreeSet<String>>,
    /// Inverse index from full uri to primary key
    by_full_uri: HashMap<String, String>,
    /// Provider endpoint per alias
    endpoints: HashMap<String, String>,
}

/// The resource registry. Thread-safe; readers observe either the pre- or
/// post-mutation state of a registration, never a partial one.
#[derive(Default)]
pub struct ResourceRegistry {
    state: RwLock<RegistryState>,
}

fn primary_key(alias: &str, uri: &str) -> String {
    format!("{alias}:{uri}")
}

fn full_uri(alias: &str, uri: &str) -> String {
    format!("{}{}/{}", URI_SCHEME, alias, uri.trim_start_matches('/'))
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the resources a provider exposes, atomically replacing any
    /// prior set for the alias, and records the provider's endpoint.
    pub fn register(&self, alias: &str, endpoint: &str, resources: Vec<ResourceDescriptor>) {
        let now = Utc::now();
        let mut state = self.state.write().unwrap();

        Self::clear_alias(&mut state, alias);

        let mut keys = BTreeSet::new();
        for descriptor in resources {
            let key = primary_key(alias, &descriptor.uri);
            let full = full_uri(alias, &descriptor.uri);

            state.by_full_uri.insert(full.clone(), key.clone());
            keys.insert(key.clone());
            state.resources.insert(
                key,
                FederatedResource {
                    server_alias: alias.to_string(),
                    uri: descriptor.uri,
                    full_uri: full,
                    name: descriptor.name,
                    mime_type: descriptor.mime_type,
                    last_seen: now,
                    cached: false,
                },
            );
        }

        debug!("Registered {} resources for server '{}'", keys.len(), alias);
        state.by_server.insert(alias.to_string(), keys);
        state.endpoints.insert(alias.to_string(), endpoint.to_string());
    }

    /// Resolves a reference to a resource. Accepts a full
    /// `mcp://<alias>/<path>` uri, an `<alias>:<path>` pair, or a bare path
    /// (first match wins).
    pub fn resolve(&self, reference: &str) -> Option<FederatedResource> {
        let state = self.state.read().unwrap();

        if reference.starts_with(URI_SCHEME) {
            let key = state.by_full_uri.get(reference)?;
            return state.resources.get(key).cloned();
        }

        if let Some((alias, path)) = reference.split_once(':') {
            if let Some(resource) = state.resources.get(&primary_key(alias, path)) {
                return Some(resource.clone());
            }
        }

        // bare path: first matching server in alias order
        let mut aliases: Vec<&String> = state.by_server.keys().collect();
        aliases.sort();
        for alias in aliases {
            if let Some(resource) = state.resources.get(&primary_key(alias, reference)) {
                return Some(resource.clone());
            }
        }

        None
    }

    /// Resolves every resource matching a glob uri pattern
    pub fn resolve_glob(&self, pattern: &str) -> Vec<FederatedResource> {
        let Ok(parsed) = McpUri::parse(pattern) else {
            return vec![];
        };

        let state = self.state.read().unwrap();

        let mut matches: Vec<FederatedResource> = state
            .resources
            .values()
            .filter(|resource| {
                uri::glob_match(&parsed.server, &resource.server_alias)
                    && uri::glob_match(
                        parsed.path.trim_start_matches('/'),
                        resource.uri.trim_start_matches('/'),
                    )
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| a.full_uri.cmp(&b.full_uri));
        matches
    }

    pub fn server_resources(&self, alias: &str) -> Vec<FederatedResource> {
        let state = self.state.read().unwrap();

        state
            .by_server
            .get(alias)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| state.resources.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_resources(&self) -> Vec<FederatedResource> {
        let state = self.state.read().unwrap();
        let mut all: Vec<_> = state.resources.values().cloned().collect();
        all.sort_by(|a, b| a.full_uri.cmp(&b.full_uri));
        all
    }

    /// Finds resources whose name or uri matches the pattern.
    /// Patterns containing glob characters match as globs, anything else as
    /// a case-insensitive substring.
    pub fn search(&self, pattern: &str) -> Vec<FederatedResource> {
        let state = self.state.read().unwrap();
        let is_glob = pattern.contains(['*', '?', '[']);
        let needle = pattern.to_ascii_lowercase();

        let mut found: Vec<FederatedResource> = state
            .resources
            .values()
            .filter(|resource| {
                if is_glob {
                    uri::glob_match(pattern, &resource.name)
                        || uri::glob_match(pattern, &resource.uri)
                        || uri::glob_match(pattern, &resource.full_uri)
                } else {
                    resource.name.to_ascii_lowercase().contains(&needle)
                        || resource.uri.to_ascii_lowercase().contains(&needle)
                        || resource.full_uri.to_ascii_lowercase().contains(&needle)
                }
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| a.full_uri.cmp(&b.full_uri));
        found
    }

    /// Marks a resolvable resource as locally cached
    pub fn mark_cached(&self, reference: &str) -> bool {
        let key = match self.resolve(reference) {
            Some(resource) => primary_key(&resource.server_alias, &resource.uri),
            None => return false,
        };

        let mut state = self.state.write().unwrap();
        match state.resources.get_mut(&key) {
            Some(resource) => {
                resource.cached = true;
                true
            }
            None => false,
        }
    }

    pub fn is_cached(&self, reference: &str) -> bool {
        self.resolve(reference).map(|r| r.cached).unwrap_or(false)
    }

    /// The provider endpoint registered for the alias
    pub fn endpoint(&self, alias: &str) -> Option<String> {
        self.state.read().unwrap().endpoints.get(alias).cloned()
    }

    pub fn servers(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut servers: Vec<_> = state.by_server.keys().cloned().collect();
        servers.sort();
        servers
    }

    pub fn clear_server(&self, alias: &str) {
        let mut state = self.state.write().unwrap();
        Self::clear_alias(&mut state, alias);
        state.endpoints.remove(alias);
    }

    pub fn clear_all(&self) {
        let mut state = self.state.write().unwrap();
        *state = RegistryState::default();
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read().unwrap();
        let mut servers: Vec<_> = state.by_server.keys().cloned().collect();
        servers.sort();

        RegistryStats {
            total_resources: state.resources.len(),
            server_count: state.by_server.len(),
            cached_count: state.resources.values().filter(|r| r.cached).count(),
            servers,
        }
    }

    /// Serializes the registry to a round-trippable snapshot
    pub fn export(&self) -> serde_json::Value {
        let state = self.state.read().unwrap();

        serde_json::json!({
            "version": EXPORT_VERSION,
            "endpoints": state.endpoints,
            "resources": state.resources.values().collect::<Vec<_>>(),
        })
    }

    /// Restores a snapshot produced by [`ResourceRegistry::export`],
    /// replacing the current contents
    pub fn import(&self, snapshot: &serde_json::Value) -> Result<()> {
        let version = snapshot
            .get("version")
            .and_then(|v| v.as_u64())
            .context("Snapshot missing version")?;
        if version != EXPORT_VERSION as u64 {
            bail!("Unsupported registry snapshot version: {version}");
        }

        let endpoints: HashMap<String, String> = serde_json::from_value(
            snapshot
                .get("endpoints")
                .cloned()
                .unwrap_or(serde_json::json!({})),
        )
        .context("Malformed endpoints in snapshot")?;

        let resources: Vec<FederatedResource> = serde_json::from_value(
            snapshot
                .get("resources")
                .cloned()
                .unwrap_or(serde_json::json!([])),
        )
        .context("Malformed resources in snapshot")?;

        let mut state = self.state.write().unwrap();
        *state = RegistryState::default();
        state.endpoints = endpoints;

        for resource in resources {
            let key = primary_key(&resource.server_alias, &resource.uri);
            state.by_full_uri.insert(resource.full_uri.clone(), key.clone());
            state
                .by_server
                .entry(resource.server_alias.clone())
                .or_default()
                .insert(key.clone());
            state.resources.insert(key, resource);
        }

        Ok(())
    }

    fn clear_alias(state: &mut RegistryState, alias: &str) {
        if let Some(keys) = state.by_server.remove(alias) {
            for key in keys {
                if let Some(resource) = state.resources.remove(&key) {
                    state.by_full_uri.remove(&resource.full_uri);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(uris: &[&str]) -> Vec<ResourceDescriptor> {
        uris.iter()
            .map(|uri| ResourceDescriptor::new(*uri, *uri))
            .collect()
    }

    #[test]
    fn test_register_and_resolve_forms() {
        let registry = ResourceRegistry::new();
        registry.register("api", "ws://api:1", descriptors(&["users.json"]));

        let by_full = registry.resolve("mcp://api/users.json").unwrap();
        assert_eq!(by_full.server_alias, "api");
        assert_eq!(by_full.uri, "users.json");
        assert_eq!(by_full.full_uri, "mcp://api/users.json");

        let by_pair = registry.resolve("api:users.json").unwrap();
        assert_eq!(by_pair, by_full);

        let bare = registry.resolve("users.json").unwrap();
        assert_eq!(bare, by_full);

        assert!(registry.resolve("mcp://api/missing.json").is_none());
    }

    #[test]
    fn test_register_replaces_prior_set() {
        let registry = ResourceRegistry::new();
        registry.register("api", "ws://api:1", descriptors(&["old.json"]));
        registry.register("api", "ws://api:1", descriptors(&["new.json"]));

        assert!(registry.resolve("mcp://api/old.json").is_none());
        assert!(registry.resolve("mcp://api/new.json").is_some());

        let resources = registry.server_resources("api");
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].uri, "new.json");
    }

    #[test]
    fn test_bare_path_first_match_is_deterministic() {
        let registry = ResourceRegistry::new();
        registry.register("beta", "ws://b:1", descriptors(&["data.json"]));
        registry.register("alpha", "ws://a:1", descriptors(&["data.json"]));

        assert_eq!(registry.resolve("data.json").unwrap().server_alias, "alpha");
    }

    #[test]
    fn test_resolve_glob() {
        let registry = ResourceRegistry::new();
        registry.register(
            "s1",
            "ws://s1:1",
            descriptors(&["logs/2024-01.json", "logs/2024-02.json", "readme.txt"]),
        );
        registry.register("s2", "ws://s2:1", descriptors(&["logs/2024-01.json"]));

        let matched = registry.resolve_glob("mcp://s1/logs/*.json");
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|r| r.server_alias == "s1"));

        let across = registry.resolve_glob("mcp://*/logs/2024-01.json");
        assert_eq!(across.len(), 2);
    }

    #[test]
    fn test_search_substring_and_glob() {
        let registry = ResourceRegistry::new();
        registry.register("api", "ws://api:1", descriptors(&["users.json", "sales.csv"]));

        assert_eq!(registry.search("users").len(), 1);
        assert_eq!(registry.search("*.csv").len(), 1);
        assert_eq!(registry.search("nothing").len(), 0);
    }

    #[test]
    fn test_mark_cached() {
        let registry = ResourceRegistry::new();
        registry.register("api", "ws://api:1", descriptors(&["users.json"]));

        assert!(!registry.is_cached("mcp://api/users.json"));
        assert!(registry.mark_cached("mcp://api/users.json"));
        assert!(registry.is_cached("mcp://api/users.json"));
        assert!(!registry.mark_cached("mcp://api/missing.json"));
    }

    #[test]
    fn test_clear_server_and_all() {
        let registry = ResourceRegistry::new();
        registry.register("a", "ws://a:1", descriptors(&["1.json"]));
        registry.register("b", "ws://b:1", descriptors(&["2.json"]));

        registry.clear_server("a");
        assert!(registry.resolve("mcp://a/1.json").is_none());
        assert!(registry.resolve("mcp://b/2.json").is_some());
        assert!(registry.endpoint("a").is_none());

        registry.clear_all();
        assert_eq!(registry.stats().total_resources, 0);
    }

    #[test]
    fn test_export_import_round_trip() {
        let registry = ResourceRegistry::new();
        registry.register("api", "ws://api:1", descriptors(&["users.json"]));
        registry.mark_cached("mcp://api/users.json");

        let snapshot = registry.export();

        let restored = ResourceRegistry::new();
        restored.import(&snapshot).unwrap();

        assert_eq!(restored.all_resources(), registry.all_resources());
        assert_eq!(restored.endpoint("api").as_deref(), Some("ws://api:1"));
        assert!(restored.is_cached("mcp://api/users.json"));
    }

    #[test]
    fn test_stats() {
        let registry = ResourceRegistry::new();
        registry.register("a", "ws://a:1", descriptors(&["1.json", "2.json"]));
        registry.register("b", "ws://b:1", descriptors(&["3.json"]));
        registry.mark_cached("mcp://a/1.json");

        let stats = registry.stats();
        assert_eq!(stats.total_resources, 3);
        assert_eq!(stats.server_count, 2);
        assert_eq!(stats.cached_count, 1);
        assert_eq!(stats.servers, vec!["a".to_string(), "b".to_string()]);
    }
}
