//! Session over a child process speaking newline-delimited JSON on
//! stdin/stdout.

use std::{
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use fedgate_core::err::{bail, Context, Result};
use fedgate_logging::{debug, trace, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
};

use crate::{
    proto::{RpcRequest, RpcResponse},
    Transport, TransportSession,
};

/// A provider session over a spawned child process
pub struct StdioSession {
    child: std::sync::Mutex<Option<Child>>,
    writer: tokio::sync::Mutex<ChildStdin>,
    reader: tokio::sync::Mutex<BufReader<ChildStdout>>,
    connected: AtomicBool,
}

impl StdioSession {
    /// Spawns the command named by the url and attaches to its pipes.
    ///
    /// The url is of the form `stdio://<program> [args...]`; a bare command
    /// line without the scheme is also accepted.
    pub async fn connect(url: &str) -> Result<Self> {
        let command_line = url.strip_prefix("stdio://").unwrap_or(url);

        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .context("Empty command for stdio transport")?;

        debug!("Spawning stdio provider: {}", command_line);

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn provider process '{program}'"))?;

        let stdin = child.stdin.take().context("Provider stdin not piped")?;
        let stdout = child.stdout.take().context("Provider stdout not piped")?;

        Ok(Self {
            child: std::sync::Mutex::new(Some(child)),
            writer: tokio::sync::Mutex::new(stdin),
            reader: tokio::sync::Mutex::new(BufReader::new(stdout)),
            connected: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl TransportSession for StdioSession {
    fn transport(&self) -> Transport {
        Transport::Stdio
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, req: RpcRequest) -> Result<()> {
        let mut frame = serde_json::to_string(&req).context("Failed to encode request")?;
        frame.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.write_all(frame.as_bytes()).await {
            self.connected.store(false, Ordering::Relaxed);
            return Err(err).context("Failed to write to provider stdin");
        }
        writer
            .flush()
            .await
            .context("Failed to flush provider stdin")?;

        Ok(())
    }

    async fn receive(&self) -> Result<RpcResponse> {
        let mut reader = self.reader.lock().await;

        loop {
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .await
                .context("Failed to read from provider stdout")?;

            if read == 0 {
                self.connected.store(false, Ordering::Relaxed);
                bail!("Provider process closed its stdout");
            }

            match serde_json::from_str::<RpcResponse>(line.trim()) {
                Ok(resp) => return Ok(resp),
                // Non-response frames (notifications, stray output) are skipped
                Err(err) => trace!("Skipping unparseable frame: {}", err),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        if let Some(mut child) = self.child.lock().unwrap().take() {
            if let Err(err) = child.start_kill() {
                warn!("Failed to kill provider process: {:?}", err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stdio_round_trip_against_cat() {
        // `cat` echoes our request back; a request frame parses as a
        // response frame with the same id since unknown fields are ignored.
        let session = StdioSession::connect("stdio://cat").await.unwrap();

        session
            .send(RpcRequest::new(41, "resources/list", serde_json::json!({})))
            .await
            .unwrap();

        let resp = session.receive().await.unwrap();
        assert_eq!(resp.id, 41);

        session.close().await.unwrap();
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_stdio_connect_missing_program_fails() {
        let res = StdioSession::connect("stdio://definitely-not-a-real-binary-xyz").await;
        assert!(res.is_err());
    }
}
