//! Byte-pipe contract between the transport and the outside world.
//!
//! The transport consumes any connected duplex byte stream; a
//! [`PipeBuilder`] tells it how to obtain one (and whether it can obtain
//! another after a drop). Listeners hand accepted sockets to the stack as
//! single-shot builders; dialers can re-dial; tests use in-memory duplex
//! pipes.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// Any connected duplex byte stream.
pub trait BytePipe: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> BytePipe for T {}

/// Produces a connected pipe per transport (re)connection attempt.
#[async_trait]
pub trait PipeBuilder: Send + 'static {
    /// Open the pipe. Called once per connection attempt.
    async fn connect(&mut self) -> io::Result<Box<dyn BytePipe>>;

    /// Whether [`PipeBuilder::connect`] can succeed again after a drop.
    ///
    /// An accepted socket is gone once it hangs up; a dialer can re-dial.
    fn supports_reconnecting(&self) -> bool {
        false
    }
}

/// Single-shot builder around an already-accepted pipe.
///
/// The first `connect` hands the pipe out; later attempts fail, and the
/// transport's retry machinery gives up on the stack, leaving the listener
/// to accept a fresh pipe for the next session.
pub struct AcceptedPipe {
    pipe: Option<Box<dyn BytePipe>>,
}

impl AcceptedPipe {
    /// Wrap an accepted pipe.
    pub fn new(pipe: impl BytePipe) -> Self {
        Self { pipe: Some(Box::new(pipe)) }
    }
}

#[async_trait]
impl PipeBuilder for AcceptedPipe {
    async fn connect(&mut self) -> io::Result<Box<dyn BytePipe>> {
        self.pipe
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "accepted pipe already consumed"))
    }
}

/// Dialing builder for outbound TCP connections.
///
/// Supports reconnecting: every attempt dials the address afresh.
pub struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    /// Builder dialing `addr` on every connection attempt.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl PipeBuilder for TcpDialer {
    async fn connect(&mut self) -> io::Result<Box<dyn BytePipe>> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn supports_reconnecting(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepted_pipe_is_single_shot() {
        let (a, _b) = tokio::io::duplex(64);
        let mut builder = AcceptedPipe::new(a);

        assert!(!builder.supports_reconnecting());
        assert!(builder.connect().await.is_ok());
        assert!(builder.connect().await.is_err());
    }
}
