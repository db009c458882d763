//! Byte streams a transport can run over.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;

/// A connected, full-duplex byte stream.
///
/// Addresses are informational; streams without them keep the defaults.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Local address, if the stream has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote address, if the stream has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Connection for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

#[cfg(unix)]
impl Connection for tokio::net::UnixStream {}

impl Connection for DuplexStream {}

/// Dial `addr` with Nagle's algorithm disabled; the writer batches instead.
pub async fn connect_tcp<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
