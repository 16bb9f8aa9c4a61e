//! Listener factory for ephemeral servers
//!
//! Binds port 0 so the OS picks a free port. The handle is owned by a single
//! lifecycle manager, which is the only caller of accept and close.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("accept timed out")]
    TimedOut,
    #[error("listener closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AcceptError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AcceptError::TimedOut)
    }
}

/// Source of incoming connections for a lifecycle manager.
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> Result<(Self::Conn, SocketAddr), AcceptError>;

    /// Release the socket. Calling it again is a no-op.
    fn close(&mut self);

    async fn accept_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<(Self::Conn, SocketAddr), AcceptError> {
        tokio::time::timeout(timeout, self.accept())
            .await
            .unwrap_or_else(|_| Err(AcceptError::TimedOut))
    }
}

pub struct EphemeralListener {
    inner: Option<TcpListener>,
    local_addr: SocketAddr,
}

impl EphemeralListener {
    pub async fn bind(host: IpAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(host, 0)).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!("Bound ephemeral listener on {}", local_addr);

        Ok(Self {
            inner: Some(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

#[async_trait]
impl Acceptor for EphemeralListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        let listener = self.inner.as_ref().ok_or(AcceptError::Closed)?;
        let (stream, peer_addr) = listener.accept().await?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        Ok((stream, peer_addr))
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!("Closed ephemeral listener on {}", self.local_addr);
        }
    }
}
