//! Session speaking JSON-RPC over HTTP POST, with an optional long-poll
//! loop for server-pushed frames.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use fedgate_core::err::{bail, Context, Result};
use fedgate_logging::trace;
use tokio::sync::{broadcast, mpsc};

use crate::{
    proto::{RpcRequest, RpcResponse},
    Transport, TransportSession,
};

const POLL_IDLE_DELAY: Duration = Duration::from_secs(1);

/// A provider session over HTTP.
///
/// Each `send` POSTs the request and queues the provider's reply for
/// `receive`. When long polling is enabled, `GET <url>/poll` frames are
/// queued the same way.
pub struct HttpSession {
    client: reqwest::Client,
    url: String,
    incoming_tx: mpsc::UnboundedSender<RpcResponse>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<RpcResponse>>,
    connected: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl HttpSession {
    pub fn connect(url: &str) -> Result<Self> {
        Self::connect_opts(url, false)
    }

    pub fn connect_opts(url: &str, long_poll: bool) -> Result<Self> {
        reqwest::Url::parse(url).with_context(|| format!("Invalid provider url: {url}"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build http client")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let session = Self {
            client: client.clone(),
            url: url.to_string(),
            incoming_tx: tx.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
            shutdown,
        };

        if long_poll {
            let poll_url = format!("{}/poll", url.trim_end_matches('/'));
            tokio::spawn(Self::poll_loop(client, poll_url, tx, shutdown_rx));
        }

        Ok(session)
    }

    async fn poll_loop(
        client: reqwest::Client,
        poll_url: String,
        tx: mpsc::UnboundedSender<RpcResponse>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let res = tokio::select! {
                res = client.get(&poll_url).send() => res,
                _ = shutdown.recv() => return,
            };

            let frames = match res {
                Ok(resp) => resp.json::<serde_json::Value>().await.ok(),
                Err(err) => {
                    trace!("Long poll failed: {}", err);
                    None
                }
            };

            match frames {
                Some(serde_json::Value::Array(items)) => {
                    for item in items {
                        if let Ok(frame) = serde_json::from_value::<RpcResponse>(item) {
                            if tx.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(item) => {
                    if let Ok(frame) = serde_json::from_value::<RpcResponse>(item) {
                        if tx.send(frame).is_err() {
                            return;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_IDLE_DELAY) => {}
                        _ = shutdown.recv() => return,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TransportSession for HttpSession {
    fn transport(&self) -> Transport {
        Transport::Http
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, req: RpcRequest) -> Result<()> {
        let res = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .await;

        let resp = match res {
            Ok(resp) => resp,
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(err).context("Failed to POST request");
            }
        };

        if !resp.status().is_success() {
            self.connected.store(false, Ordering::Relaxed);
            bail!("Provider returned http status {}", resp.status());
        }

        let frame: RpcResponse = resp
            .json()
            .await
            .context("Failed to decode provider response")?;

        self.incoming_tx
            .send(frame)
            .map_err(|_| fedgate_core::err::anyhow!("Session is closed"))?;

        Ok(())
    }

    async fn receive(&self) -> Result<RpcResponse> {
        match self.incoming.lock().await.recv().await {
            Some(resp) => Ok(resp),
            None => bail!("Session closed while awaiting response"),
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_connect_rejects_malformed_url() {
        assert!(HttpSession::connect("not a url").is_err());
    }
}
