//! An in-process provider and session, most useful for testing.
//!
//! The provider serves canned resources and tools and counts reads so that
//! tests can assert on fetch behavior without a remote process.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use fedgate_core::err::{bail, Result};
use serde_json::json;

use crate::{
    proto::{
        ResourceDescriptor, RpcRequest, RpcResponse, ToolDescriptor, METHOD_CALL_TOOL,
        METHOD_LIST_RESOURCES, METHOD_LIST_TOOLS, METHOD_READ_RESOURCE,
    },
    SessionFactory, Transport, TransportSession,
};

#[derive(Default)]
struct ProviderState {
    resources: Vec<ResourceDescriptor>,
    contents: HashMap<String, serde_json::Value>,
    tools: Vec<ToolDescriptor>,
    tool_results: HashMap<String, serde_json::Value>,
}

/// Canned provider data shared by any number of sessions
#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<ProviderState>,
    reads: Mutex<HashMap<String, u64>>,
    total_reads: AtomicU64,
    failing: AtomicBool,
}

impl MemoryProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a resource whose read returns `contents: [{text}]`
    pub fn add_text_resource(&self, uri: &str, name: &str, text: &str) {
        self.add_resource(
            ResourceDescriptor::new(uri, name),
            json!({ "contents": [{ "text": text }] }),
        );
    }

    /// Registers a resource whose read returns `contents: [{blob}]`
    pub fn add_blob_resource(&self, uri: &str, name: &str, base64_blob: &str) {
        self.add_resource(
            ResourceDescriptor::new(uri, name),
            json!({ "contents": [{ "blob": base64_blob }] }),
        );
    }

    pub fn add_resource(&self, descriptor: ResourceDescriptor, contents: serde_json::Value) {
        let mut state = self.state.lock().unwrap();
        state.contents.insert(descriptor.uri.clone(), contents);
        state.resources.push(descriptor);
    }

    /// Registers a tool whose call returns the supplied content
    pub fn add_tool(&self, name: &str, description: Option<&str>, content: serde_json::Value) {
        let mut state = self.state.lock().unwrap();
        state.tools.push(ToolDescriptor {
            name: name.into(),
            description: description.map(|d| d.into()),
        });
        state.tool_results.insert(name.into(), content);
    }

    /// How many times the resource has been read
    pub fn read_count(&self, uri: &str) -> u64 {
        *self.reads.lock().unwrap().get(uri).unwrap_or(&0)
    }

    pub fn total_reads(&self) -> u64 {
        self.total_reads.load(Ordering::Relaxed)
    }

    /// While set, every request is answered with an error response
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Opens a session serving this provider's data
    pub fn session(self: &Arc<Self>) -> MemorySession {
        MemorySession {
            provider: Arc::clone(self),
            queue: Mutex::new(VecDeque::new()),
            notify: tokio::sync::Notify::new(),
            connected: AtomicBool::new(true),
        }
    }

    fn handle(&self, req: &RpcRequest) -> RpcResponse {
        if self.failing.load(Ordering::Relaxed) {
            return RpcResponse::error(req.id, -32000, "Provider failure injected");
        }

        let state = self.state.lock().unwrap();

        match req.method.as_str() {
            METHOD_LIST_RESOURCES => RpcResponse::result(
                req.id,
                json!({ "resources": state.resources }),
            ),
            METHOD_LIST_TOOLS => {
                RpcResponse::result(req.id, json!({ "tools": state.tools }))
            }
            METHOD_READ_RESOURCE => {
                let uri = req.params.get("uri").and_then(|u| u.as_str()).unwrap_or("");

                match state.contents.get(uri) {
                    Some(contents) => {
                        *self.reads.lock().unwrap().entry(uri.into()).or_insert(0) += 1;
                        self.total_reads.fetch_add(1, Ordering::Relaxed);
                        RpcResponse::result(req.id, contents.clone())
                    }
                    None => RpcResponse::error(req.id, -32002, format!("Unknown resource: {uri}")),
                }
            }
            METHOD_CALL_TOOL => {
                let name = req.params.get("name").and_then(|n| n.as_str()).unwrap_or("");

                match state.tool_results.get(name) {
                    Some(content) => {
                        RpcResponse::result(req.id, json!({ "content": content.clone() }))
                    }
                    None => RpcResponse::error(req.id, -32601, format!("Unknown tool: {name}")),
                }
            }
            other => RpcResponse::error(req.id, -32601, format!("Unknown method: {other}")),
        }
    }
}

/// A session answering requests from an in-process [`MemoryProvider`]
pub struct MemorySession {
    provider: Arc<MemoryProvider>,
    queue: Mutex<VecDeque<RpcResponse>>,
    notify: tokio::sync::Notify,
    connected: AtomicBool,
}

#[async_trait]
impl TransportSession for MemorySession {
    fn transport(&self) -> Transport {
        Transport::Stdio
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, req: RpcRequest) -> Result<()> {
        if !self.is_connected() {
            bail!("Session is closed");
        }

        let resp = self.provider.handle(&req);
        self.queue.lock().unwrap().push_back(resp);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<RpcResponse> {
        loop {
            if let Some(resp) = self.queue.lock().unwrap().pop_front() {
                return Ok(resp);
            }

            if !self.is_connected() {
                bail!("Session is closed");
            }

            self.notify.notified().await;
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// A [`SessionFactory`] resolving urls to in-process providers.
///
/// Urls can be marked as failing to exercise retry and fallback paths; every
/// open attempt is recorded for assertions.
#[derive(Default)]
pub struct MemorySessionFactory {
    providers: Mutex<HashMap<String, Arc<MemoryProvider>>>,
    failing: Mutex<HashSet<String>>,
    opens: Mutex<Vec<(Transport, String)>>,
}

impl MemorySessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, url: &str, provider: Arc<MemoryProvider>) {
        self.providers.lock().unwrap().insert(url.into(), provider);
    }

    /// Marks a url so that opening it fails
    pub fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.into());
    }

    pub fn restore_url(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    /// Every `(transport, url)` open attempt so far, in order
    pub fn open_attempts(&self) -> Vec<(Transport, String)> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn open(&self, transport: Transport, url: &str) -> Result<Box<dyn TransportSession>> {
        self.opens.lock().unwrap().push((transport, url.into()));

        if self.failing.lock().unwrap().contains(url) {
            bail!("Connection refused: {url}");
        }

        let provider = self
            .providers
            .lock()
            .unwrap()
            .get(url)
            .cloned();

        match provider {
            Some(provider) => Ok(Box::new(provider.session())),
            None => bail!("No provider registered for url: {url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_session_counts_reads() {
        let provider = MemoryProvider::new();
        provider.add_text_resource("data.json", "data", "[]");

        let session = provider.session();
        session
            .send(RpcRequest::new(
                1,
                METHOD_READ_RESOURCE,
                json!({"uri": "data.json"}),
            ))
            .await
            .unwrap();
        let resp = session.receive().await.unwrap();

        assert!(resp.result.is_some());
        assert_eq!(provider.read_count("data.json"), 1);
    }

    #[tokio::test]
    async fn test_factory_records_attempts_and_fails() {
        let factory = MemorySessionFactory::new();
        factory.fail_url("tcp://down:1");

        let res = factory.open(Transport::Tcp, "tcp://down:1").await;
        assert!(res.is_err());
        assert_eq!(
            factory.open_attempts(),
            vec![(Transport::Tcp, "tcp://down:1".to_string())]
        );
    }
}
