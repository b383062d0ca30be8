//! Session over a WebSocket, one JSON frame per text message.
//!
//! A background task owns the read side, answers pings, emits a periodic
//! keepalive ping, and reconnects with exponential backoff when the peer
//! goes away.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use fedgate_core::err::{bail, Context, Result};
use fedgate_logging::{debug, trace, warn};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    proto::{RpcRequest, RpcResponse},
    Backoff, Transport, TransportSession,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A provider session over a WebSocket
pub struct WebsocketSession {
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<RpcResponse>>,
    connected: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
}

impl WebsocketSession {
    /// Connects to `ws://` / `wss://` urls
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to open websocket to {url}"))?;
        let (sink, source) = stream.split();

        let sink = Arc::new(tokio::sync::Mutex::new(Some(sink)));
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(Self::read_loop(
            url.to_string(),
            source,
            Arc::clone(&sink),
            tx,
            Arc::clone(&connected),
            shutdown_rx,
        ));

        Ok(Self {
            sink,
            incoming: tokio::sync::Mutex::new(rx),
            connected,
            shutdown,
        })
    }

    async fn read_loop(
        url: String,
        mut source: WsSource,
        sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
        tx: mpsc::UnboundedSender<RpcResponse>,
        connected: Arc<AtomicBool>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        loop {
            let msg = tokio::select! {
                msg = source.next() => msg,
                _ = keepalive.tick() => {
                    if let Some(sink) = sink.lock().await.as_mut() {
                        let _ = sink.send(Message::Ping(vec![])).await;
                    }
                    continue;
                }
                _ = shutdown.recv() => return,
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RpcResponse>(&text) {
                        Ok(resp) => {
                            if tx.send(resp).is_err() {
                                return;
                            }
                        }
                        Err(err) => trace!("Skipping unparseable frame: {}", err),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Some(sink) = sink.lock().await.as_mut() {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    connected.store(false, Ordering::Relaxed);
                    *sink.lock().await = None;

                    match Self::redial(&url, &mut shutdown).await {
                        Some((new_sink, new_source)) => {
                            source = new_source;
                            *sink.lock().await = Some(new_sink);
                            connected.store(true, Ordering::Relaxed);
                            debug!("Reconnected websocket to {}", url);
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn redial(
        url: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<(WsSink, WsSource)> {
        let mut backoff = Backoff::new(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                _ = shutdown.recv() => return None,
            }

            match connect_async(url).await {
                Ok((stream, _)) => return Some(stream.split()),
                Err(err) => warn!("Websocket reconnect to {} failed: {:?}", url, err),
            }
        }
    }
}

#[async_trait]
impl TransportSession for WebsocketSession {
    fn transport(&self) -> Transport {
        Transport::Websocket
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, req: RpcRequest) -> Result<()> {
        let frame = serde_json::to_string(&req).context("Failed to encode request")?;

        let mut sink = self.sink.lock().await;
        let sink = match sink.as_mut() {
            Some(sink) => sink,
            None => bail!("Session is not connected"),
        };

        if let Err(err) = sink.send(Message::Text(frame)).await {
            self.connected.store(false, Ordering::Relaxed);
            return Err(err).context("Failed to send frame");
        }

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

        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }

        Ok(())
    }
}
