use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use fedgate_core::err::{bail, Error, Result};
use serde::{Deserialize, Serialize};

use crate::proto::{RpcRequest, RpcResponse};

/// The transports a provider session can run over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
    Websocket,
    Tcp,
    Auto,
}

impl Transport {
    /// Infers the transport from the url scheme, defaulting to stdio
    pub fn from_url(url: &str) -> Self {
        let scheme = url.split("://").next().unwrap_or("");

        match scheme.to_ascii_lowercase().as_str() {
            "stdio" => Self::Stdio,
            "http" | "https" => Self::Http,
            "ws" | "wss" => Self::Websocket,
            "tcp" => Self::Tcp,
            _ => Self::Stdio,
        }
    }

    /// The next transport in the fixed fallback rotation
    pub fn next_fallback(&self) -> Self {
        match self {
            Self::Stdio => Self::Http,
            Self::Http => Self::Websocket,
            Self::Websocket => Self::Tcp,
            Self::Tcp => Self::Stdio,
            Self::Auto => Self::Stdio,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Websocket => "websocket",
            Self::Tcp => "tcp",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "stdio" => Self::Stdio,
            "http" | "https" => Self::Http,
            "websocket" | "ws" | "wss" => Self::Websocket,
            "tcp" => Self::Tcp,
            "auto" => Self::Auto,
            other => bail!("Unknown transport: '{other}'"),
        })
    }
}

/// A live, framed session to a remote provider.
///
/// Implementations preserve per-session send ordering. Responses may arrive
/// out of order on transports that allow it; correlation is the caller's
/// concern (see [`crate::ProviderClient`]).
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn transport(&self) -> Transport;

    fn is_connected(&self) -> bool;

    /// Sends a request frame
    async fn send(&self, req: RpcRequest) -> Result<()>;

    /// Receives the next response frame
    async fn receive(&self) -> Result<RpcResponse>;

    /// Closes the session, releasing any underlying process or socket
    async fn close(&self) -> Result<()>;
}

/// Exponential backoff doubling from the initial delay, capped at 30s
pub struct Backoff {
    next: Duration,
}

pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self { next: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(BACKOFF_CAP);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_url() {
        assert_eq!(Transport::from_url("stdio://./server"), Transport::Stdio);
        assert_eq!(Transport::from_url("https://host/x"), Transport::Http);
        assert_eq!(Transport::from_url("wss://host/x"), Transport::Websocket);
        assert_eq!(Transport::from_url("tcp://host:9000"), Transport::Tcp);
        assert_eq!(Transport::from_url("./server"), Transport::Stdio);
    }

    #[test]
    fn test_fallback_rotation() {
        let mut t = Transport::Stdio;
        let mut seen = vec![];
        for _ in 0..5 {
            t = t.next_fallback();
            seen.push(t);
        }

        assert_eq!(
            seen,
            vec![
                Transport::Http,
                Transport::Websocket,
                Transport::Tcp,
                Transport::Stdio,
                Transport::Http,
            ]
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1));

        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
