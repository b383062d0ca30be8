//! Session over a TCP socket speaking newline-delimited JSON.
//!
//! A background task owns the read half, parses frames into a channel, and
//! redials with exponential backoff when the peer drops the connection.

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
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, mpsc},
};

use crate::{
    proto::{RpcRequest, RpcResponse},
    Backoff, Transport, TransportSession,
};

/// A provider session over TCP
pub struct TcpSession {
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<RpcResponse>>,
    connected: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
}

impl TcpSession {
    /// Connects to `tcp://<host>:<port>`
    pub async fn connect(url: &str) -> Result<Self> {
        let addr = url.strip_prefix("tcp://").unwrap_or(url).to_string();

        let stream = Self::dial(&addr).await?;
        let (read, write) = stream.into_split();

        let writer = Arc::new(tokio::sync::Mutex::new(Some(write)));
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(Self::read_loop(
            addr,
            read,
            Arc::clone(&writer),
            tx,
            Arc::clone(&connected),
            shutdown_rx,
        ));

        Ok(Self {
            writer,
            incoming: tokio::sync::Mutex::new(rx),
            connected,
            shutdown,
        })
    }

    async fn dial(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to tcp://{addr}"))?;

        stream.set_nodelay(true)?;
        socket2::SockRef::from(&stream)
            .set_keepalive(true)
            .context("Failed to enable tcp keepalive")?;

        Ok(stream)
    }

    async fn read_loop(
        addr: String,
        read: OwnedReadHalf,
        writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
        tx: mpsc::UnboundedSender<RpcResponse>,
        connected: Arc<AtomicBool>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut reader = BufReader::new(read);

        loop {
            let mut line = String::new();

            let read = tokio::select! {
                res = reader.read_line(&mut line) => res,
                _ = shutdown.recv() => return,
            };

            match read {
                Ok(0) | Err(_) => {
                    connected.store(false, Ordering::Relaxed);
                    *writer.lock().await = None;

                    match Self::redial(&addr, &mut shutdown).await {
                        Some((new_read, new_write)) => {
                            reader = BufReader::new(new_read);
                            *writer.lock().await = Some(new_write);
                            connected.store(true, Ordering::Relaxed);
                            debug!("Reconnected to tcp://{}", addr);
                        }
                        None => return,
                    }
                }
                Ok(_) => match serde_json::from_str::<RpcResponse>(line.trim()) {
                    Ok(resp) => {
                        if tx.send(resp).is_err() {
                            return;
                        }
                    }
                    Err(err) => trace!("Skipping unparseable frame: {}", err),
                },
            }
        }
    }

    /// Redials until connected or shut down, backing off exponentially
    async fn redial(
        addr: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<(OwnedReadHalf, OwnedWriteHalf)> {
        let mut backoff = Backoff::new(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                _ = shutdown.recv() => return None,
            }

            match Self::dial(addr).await {
                Ok(stream) => return Some(stream.into_split()),
                Err(err) => warn!("Reconnect to tcp://{} failed: {:?}", addr, err),
            }
        }
    }
}

#[async_trait]
impl TransportSession for TcpSession {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, req: RpcRequest) -> Result<()> {
        let mut frame = serde_json::to_string(&req).context("Failed to encode request")?;
        frame.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = match writer.as_mut() {
            Some(writer) => writer,
            None => bail!("Session is not connected"),
        };

        if let Err(err) = writer.write_all(frame.as_bytes()).await {
            self.connected.store(false, Ordering::Relaxed);
            return Err(err).context("Failed to write frame");
        }

        Ok(())
    }

    async fn receive(&self) -> Result<RpcResponse> {
        match self.incoming.lock().await.recv().await {
            Some(resp) => Ok(resp),
            None => {
                self.connected.store(false, Ordering::Relaxed);
                bail!("Session closed while awaiting response")
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(());
        *self.writer.lock().await = None;
        Ok(())
    }
}
