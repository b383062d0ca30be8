use async_trait::async_trait;
use fedgate_core::err::Result;

use crate::{
    http::HttpSession, stdio::StdioSession, tcp::TcpSession, websocket::WebsocketSession,
    Transport, TransportSession,
};

/// Opens transport sessions.
///
/// The pool depends on this seam rather than on concrete transports so that
/// tests can substitute in-process providers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, transport: Transport, url: &str) -> Result<Box<dyn TransportSession>>;
}

/// Opens real transport sessions by transport kind
#[derive(Default)]
pub struct DefaultSessionFactory;

#[async_trait]
impl SessionFactory for DefaultSessionFactory {
    async fn open(&self, transport: Transport, url: &str) -> Result<Box<dyn TransportSession>> {
        let transport = match transport {
            Transport::Auto => Transport::from_url(url),
            other => other,
        };

        Ok(match transport {
            Transport::Stdio => Box::new(StdioSession::connect(url).await?),
            Transport::Http => Box::new(HttpSession::connect(url)?),
            Transport::Websocket => Box::new(WebsocketSession::connect(url).await?),
            Transport::Tcp => Box::new(TcpSession::connect(url).await?),
            Transport::Auto => unreachable!(),
        })
    }
}
