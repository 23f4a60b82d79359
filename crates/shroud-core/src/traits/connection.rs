//! Physical connection trait

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A physical link that can be attached to a session
///
/// Anything byte-oriented and bidirectional qualifies. The addresses are
/// only used for reporting, so in-memory transports return `None`.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Local address of the link, if it has one
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote address of the link, if it has one
    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl Connection for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl Connection for DuplexStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
