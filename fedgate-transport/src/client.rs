use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use fedgate_core::err::{bail, Context, Result};
use fedgate_logging::trace;
use serde_json::json;

use crate::{
    proto::{
        ListResourcesResult, ListToolsResult, ResourceDescriptor, RpcRequest, RpcResponse,
        ToolDescriptor, METHOD_CALL_TOOL, METHOD_LIST_RESOURCES, METHOD_LIST_TOOLS,
        METHOD_READ_RESOURCE,
    },
    Transport, TransportSession,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A provider client over an underlying transport session.
///
/// Requests carry monotonically increasing correlation ids; responses are
/// matched by id, with out-of-order responses buffered until their caller
/// claims them.
pub struct ProviderClient {
    session: Box<dyn TransportSession>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, RpcResponse>>,
    recv_lock: tokio::sync::Mutex<()>,
    timeout: Duration,
    broken: AtomicBool,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("next_id", &self.next_id)
            .field("timeout", &self.timeout)
            .field("broken", &self.broken)
            .finish()
    }
}

impl ProviderClient {
    pub fn new(session: Box<dyn TransportSession>) -> Self {
        Self::with_timeout(session, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(session: Box<dyn TransportSession>, timeout: Duration) -> Self {
        Self {
            session,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            recv_lock: tokio::sync::Mutex::new(()),
            timeout,
            broken: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> Transport {
        self.session.transport()
    }

    /// Whether the session is usable: connected and no request has timed out
    pub fn healthy(&self) -> bool {
        !self.broken.load(Ordering::Relaxed) && self.session.is_connected()
    }

    /// Marks the session unusable so the pool replaces it
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    /// Performs one request/response round trip
    pub async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.session
            .send(RpcRequest::new(id, method, params))
            .await
            .with_context(|| format!("Failed to send '{method}' request"))?;

        match tokio::time::timeout(self.timeout, self.wait_for(id)).await {
            Ok(res) => res,
            Err(_) => {
                self.broken.store(true, Ordering::Relaxed);
                bail!("Request '{method}' timed out after {:?}", self.timeout)
            }
        }
    }

    async fn wait_for(&self, id: u64) -> Result<serde_json::Value> {
        loop {
            if let Some(resp) = self.pending.lock().unwrap().remove(&id) {
                return Self::unwrap_response(resp);
            }

            // One caller drains the session at a time; responses for other
            // callers are parked in the pending map.
            let _guard = self.recv_lock.lock().await;

            if let Some(resp) = self.pending.lock().unwrap().remove(&id) {
                return Self::unwrap_response(resp);
            }

            let resp = self.session.receive().await?;

            if resp.id == id {
                return Self::unwrap_response(resp);
            }

            trace!("Buffering out-of-order response for request {}", resp.id);
            self.pending.lock().unwrap().insert(resp.id, resp);
        }
    }

    fn unwrap_response(resp: RpcResponse) -> Result<serde_json::Value> {
        if let Some(err) = resp.error {
            bail!("Provider returned error {}: {}", err.code, err.message);
        }

        resp.result
            .context("Provider response carried neither result nor error")
    }

    /// Lists the resources the provider exposes
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let result = self.request(METHOD_LIST_RESOURCES, json!({})).await?;

        let parsed: ListResourcesResult =
            serde_json::from_value(result).context("Malformed resource list")?;
        Ok(parsed.resources)
    }

    /// Lists the tools the provider exposes
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result = self.request(METHOD_LIST_TOOLS, json!({})).await?;

        let parsed: ListToolsResult =
            serde_json::from_value(result).context("Malformed tool list")?;
        Ok(parsed.tools)
    }

    /// Reads a resource, returning the raw response value for decoding
    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value> {
        self.request(METHOD_READ_RESOURCE, json!({ "uri": uri }))
            .await
    }

    /// Invokes a tool, returning the raw response value for decoding
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.request(METHOD_CALL_TOOL, json!({ "name": name, "arguments": arguments }))
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    #[tokio::test]
    async fn test_client_round_trip_over_memory_session() {
        let provider = MemoryProvider::new();
        provider.add_text_resource("users.json", "users", "[]");
        provider.add_tool("run_query", Some("runs sql"), json!({"rows": []}));

        let client = ProviderClient::new(Box::new(provider.session()));

        let resources = client.list_resources().await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].uri, "users.json");

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "run_query");

        let read = client.read_resource("users.json").await.unwrap();
        assert_eq!(read["contents"][0]["text"], json!("[]"));

        assert!(client.healthy());
    }

    #[tokio::test]
    async fn test_client_surfaces_provider_errors() {
        let provider = MemoryProvider::new();
        let client = ProviderClient::new(Box::new(provider.session()));

        let err = client.read_resource("missing.csv").await.unwrap_err();
        assert!(err.to_string().contains("Provider returned error"));
    }

    #[tokio::test]
    async fn test_client_correlates_interleaved_requests() {
        let provider = MemoryProvider::new();
        provider.add_text_resource("a.json", "a", "[1]");

        let client = std::sync::Arc::new(ProviderClient::new(Box::new(provider.session())));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let client = std::sync::Arc::clone(&client);
                tokio::spawn(async move { client.list_resources().await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 1);
        }
    }
}
