//! Byte stream contract the engine runs on.
//!
//! The handshake uses the transport whole; a connection splits it so the read
//! task and the write gate own one half each.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn TransportWriter>;

/// Write half of a transport.
pub trait TransportWriter: AsyncWrite + Send + Unpin {
    /// Makes dropping the transport reset the connection instead of closing it.
    fn abort(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + Sized + 'static {
    fn is_secure(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn into_split(self) -> (BoxedReader, BoxedWriter);
}

impl TransportWriter for OwnedWriteHalf {
    fn abort(&mut self) -> io::Result<()> {
        let stream: &TcpStream = self.as_ref();
        SockRef::from(stream).set_linger(Some(Duration::ZERO))
    }
}

impl Transport for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn into_split(self) -> (BoxedReader, BoxedWriter) {
        let (reader, writer) = TcpStream::into_split(self);
        (Box::new(reader), Box::new(writer))
    }
}

impl TransportWriter for WriteHalf<DuplexStream> {}

/// In-memory pipe, used to drive connections without sockets.
impl Transport for DuplexStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn into_split(self) -> (BoxedReader, BoxedWriter) {
        let (reader, writer): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) = tokio::io::split(self);
        (Box::new(reader), Box::new(writer))
    }
}
