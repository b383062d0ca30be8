//! A transport-agnostic pool of provider sessions keyed by
//! `transport://url`, with health probing, retry with transport fallback,
//! and LRU eviction under a fixed size cap.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use fedgate_core::{
    config::PoolConfig,
    err::{Error, GatewayError, Result},
};
use fedgate_logging::{best_effort, debug, warn};
use fedgate_transport::{ProviderClient, SessionFactory, Transport};
use serde::Serialize;
use tokio::sync::broadcast;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The session pool.
///
/// Cloning is cheap and shares the underlying pool. Background probe and
/// cleanup tasks stop when the last clone is dropped.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
    _terminator: Arc<broadcast::Sender<()>>,
}

struct PoolInner {
    conf: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    sessions: tokio::sync::Mutex<HashMap<String, PooledSession>>,
    /// Per-url single-flight latches so one open serves concurrent callers
    opening: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    seq: AtomicU64,
}

struct PooledSession {
    transport: Transport,
    client: Arc<ProviderClient>,
    connected_at: Instant,
    last_used: Instant,
    use_count: u64,
    /// Insertion order, breaks eviction ties deterministically
    seq: u64,
}

/// Pool observability counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub unhealthy_connections: usize,
    pub connections_by_transport: HashMap<String, usize>,
    pub average_use_count: f64,
}

fn pool_key(transport: Transport, url: &str) -> String {
    format!("{}://{}", transport.as_str(), url)
}

impl SessionPool {
    pub fn new(conf: PoolConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let inner = Arc::new(PoolInner {
            conf,
            factory,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            opening: tokio::sync::Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        });

        let (terminator, _) = broadcast::channel(1);
        Self::spawn_background_tasks(&inner, &terminator);

        Self {
            inner,
            _terminator: Arc::new(terminator),
        }
    }

    fn spawn_background_tasks(inner: &Arc<PoolInner>, terminator: &broadcast::Sender<()>) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("No async runtime, pool background tasks disabled");
            return;
        }

        {
            let inner = Arc::clone(inner);
            let mut term = terminator.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(inner.conf.health_check_interval()) => {}
                        _ = term.recv() => return,
                    }

                    inner.probe_all().await;
                }
            });
        }

        {
            let inner = Arc::clone(inner);
            let mut term = terminator.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(inner.conf.idle_timeout() / 2) => {}
                        _ = term.recv() => return,
                    }

                    inner.evict_expired().await;
                }
            });
        }
    }

    /// Returns a healthy session for the url, opening one if necessary.
    ///
    /// With an explicit transport hint only that transport is attempted; with
    /// [`Transport::Auto`] the transport is inferred from the url scheme and
    /// rotated through the fallback order after each failed attempt.
    pub async fn get_session(
        &self,
        url: &str,
        transport: Transport,
    ) -> Result<Arc<ProviderClient>> {
        let initial = match transport {
            Transport::Auto => Transport::from_url(url),
            other => other,
        };

        if let Some(client) = self.inner.lookup(&pool_key(initial, url)).await {
            return Ok(client);
        }

        // Serialize opens per url so concurrent callers share one session
        let latch = {
            let mut opening = self.inner.opening.lock().await;
            Arc::clone(
                opening
                    .entry(url.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        let result = {
            let _guard = latch.lock().await;

            match self.inner.lookup(&pool_key(initial, url)).await {
                Some(client) => Ok(client),
                None => self.inner.open_and_insert(url, transport).await,
            }
        };

        self.inner.opening.lock().await.remove(url);

        result
    }

    /// Closes every pooled session and forgets them
    pub async fn close_all(&self) -> Result<()> {
        let sessions = {
            let mut map = self.inner.sessions.lock().await;
            map.drain().collect::<Vec<_>>()
        };

        for (key, session) in sessions {
            best_effort(
                &format!("Failed to close session '{key}'"),
                session.client.close().await,
            );
        }

        Ok(())
    }

    /// The keys currently pooled, mainly for diagnostics
    pub async fn keys(&self) -> Vec<String> {
        let sessions = self.inner.sessions.lock().await;
        let mut keys: Vec<_> = sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn stats(&self) -> PoolStats {
        let sessions = self.inner.sessions.lock().await;

        let healthy = sessions.values().filter(|s| s.client.healthy()).count();
        let mut by_transport: HashMap<String, usize> = HashMap::new();
        for session in sessions.values() {
            *by_transport
                .entry(session.transport.as_str().to_string())
                .or_insert(0) += 1;
        }

        let total_uses: u64 = sessions.values().map(|s| s.use_count).sum();

        PoolStats {
            total_connections: sessions.len(),
            healthy_connections: healthy,
            unhealthy_connections: sessions.len() - healthy,
            connections_by_transport: by_transport,
            average_use_count: if sessions.is_empty() {
                0.0
            } else {
                total_uses as f64 / sessions.len() as f64
            },
        }
    }
}

impl PoolInner {
    /// Returns the cached session for the key if it is healthy.
    /// An unhealthy entry is discarded so the caller opens a fresh one.
    async fn lookup(&self, key: &str) -> Option<Arc<ProviderClient>> {
        let mut sessions = self.sessions.lock().await;

        let healthy = sessions.get(key).map(|s| s.client.healthy());

        match healthy {
            Some(true) => {
                let session = sessions.get_mut(key).unwrap();
                session.last_used = Instant::now();
                session.use_count += 1;
                Some(Arc::clone(&session.client))
            }
            Some(false) => {
                debug!("Discarding unhealthy session '{}'", key);
                let session = sessions.remove(key).unwrap();
                tokio::spawn(async move {
                    best_effort(
                        "Failed to close unhealthy session",
                        session.client.close().await,
                    );
                });
                None
            }
            None => None,
        }
    }

    async fn open_and_insert(&self, url: &str, hint: Transport) -> Result<Arc<ProviderClient>> {
        let auto = hint == Transport::Auto;
        let mut transport = match hint {
            Transport::Auto => Transport::from_url(url),
            other => other,
        };

        let mut last_err: Option<Error> = None;

        for attempt in 1..=self.conf.retry_attempts.max(1) {
            match self.factory.open(transport, url).await {
                Ok(session) => {
                    let client = Arc::new(ProviderClient::new(session));
                    self.insert(transport, url, Arc::clone(&client)).await;
                    return Ok(client);
                }
                Err(err) => {
                    warn!(
                        "Attempt {}/{} to open {} session to '{}' failed: {}",
                        attempt, self.conf.retry_attempts, transport, url, err
                    );
                    last_err = Some(err);

                    if auto {
                        transport = transport.next_fallback();
                    }

                    if attempt < self.conf.retry_attempts {
                        tokio::time::sleep(self.conf.retry_delay()).await;
                    }
                }
            }
        }

        Err(GatewayError::ConnectFailed {
            url: url.to_string(),
            cause: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".into()),
        }
        .into())
    }

    async fn insert(&self, transport: Transport, url: &str, client: Arc<ProviderClient>) {
        let mut sessions = self.sessions.lock().await;

        // Make room under the cap, oldest last_used first
        while sessions.len() >= self.conf.max_connections.max(1) {
            let victim = sessions
                .iter()
                .min_by_key(|(_, s)| (s.last_used, s.seq))
                .map(|(k, _)| k.clone());

            match victim {
                Some(key) => {
                    debug!("Evicting pooled session '{}'", key);
                    let session = sessions.remove(&key).unwrap();
                    tokio::spawn(async move {
                        best_effort(
                            "Failed to close evicted session",
                            session.client.close().await,
                        );
                    });
                }
                None => break,
            }
        }

        let now = Instant::now();
        sessions.insert(
            pool_key(transport, url),
            PooledSession {
                transport,
                client,
                connected_at: now,
                last_used: now,
                use_count: 1,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    /// Probes every pooled session with a cheap operation;
    /// failures mark the session unhealthy for the next lookup
    async fn probe_all(&self) {
        let snapshot: Vec<(String, Arc<ProviderClient>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(k, s)| (k.clone(), Arc::clone(&s.client)))
                .collect()
        };

        for (key, client) in snapshot {
            match tokio::time::timeout(PROBE_TIMEOUT, client.list_resources()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("Health probe failed for '{}': {}", key, err);
                    client.mark_broken();
                }
                Err(_) => {
                    warn!("Health probe timed out for '{}'", key);
                    client.mark_broken();
                }
            }
        }
    }

    /// Evicts sessions past their ttl or idle timeout
    async fn evict_expired(&self) {
        let now = Instant::now();
        let mut evicted = vec![];

        {
            let mut sessions = self.sessions.lock().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| {
                    now.duration_since(s.connected_at) > self.conf.connection_ttl()
                        || now.duration_since(s.last_used) > self.conf.idle_timeout()
                })
                .map(|(k, _)| k.clone())
                .collect();

            for key in expired {
                debug!("Evicting expired session '{}'", key);
                evicted.push(sessions.remove(&key).unwrap());
            }
        }

        for session in evicted {
            best_effort(
                "Failed to close expired session",
                session.client.close().await,
            );
        }
    }
}
