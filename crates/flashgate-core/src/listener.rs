//! Listeners: where accepted pipes become protocol stacks.
//!
//! A listener produces one [`PipeBuilder`] per accepted connection and hands
//! it to its client; the client builds a stack on top and keeps it alive.
//! The gateway's reference listener is TCP; anything that can yield a
//! connected byte pipe (an RFCOMM socket, an in-memory duplex) fits the same
//! contract.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::pipe::{AcceptedPipe, PipeBuilder};

/// Receives every accepted connection.
#[async_trait]
pub trait ListenerClient: Send + 'static {
    /// A peer connected; build a stack over `pipe` and own it.
    async fn on_connect(&mut self, pipe: Box<dyn PipeBuilder>, peer: SocketAddr);
}

/// TCP listener for the gateway.
pub struct TcpGateListener {
    listener: TcpListener,
}

impl TcpGateListener {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, handing each to `client`.
    ///
    /// Transient accept failures are logged and the loop continues; only a
    /// fatal listener error ends it.
    pub async fn run(self, mut client: impl ListenerClient) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "connection accepted");
                    if let Err(error) = stream.set_nodelay(true) {
                        tracing::debug!(%error, "failed to set nodelay");
                    }
                    client.on_connect(Box::new(AcceptedPipe::new(stream)), peer).await;
                },
                Err(error) if is_transient(&error) => {
                    tracing::warn!(%error, "accept failed, continuing");
                },
                Err(error) => {
                    tracing::error!(%error, "listener failed");
                    return Err(error);
                },
            }
        }
    }
}

/// Accept errors that do not invalidate the listening socket.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
