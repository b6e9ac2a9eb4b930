use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

/// Byte-level seam between the codec and the underlying connection. Only whole
/// reads and whole writes are observable through it.
pub trait Transport {
    /// Write all of `raw` or fail.
    fn send(&mut self, raw: &[u8]) -> NetworkResult<()>;

    /// Read exactly `count` bytes or fail. A peer close before `count` bytes have
    /// accumulated surfaces as `NetworkError::Disconnected`.
    fn recv_exact(&mut self, count: usize) -> NetworkResult<Vec<u8>>;
}

/// A single accepted TCP connection carrying length-delimited messages.
pub struct FramedStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl FramedStream {
    #[inline]
    pub fn new(stream: TcpStream) -> io::Result<FramedStream> {
        let peer = stream.peer_addr()?;
        Ok(FramedStream { stream, peer })
    }

    /// The peer endpoint (host, port). Used as the session key in the monitor.
    #[inline]
    pub fn peer_endpoint(&self) -> SocketAddr {
        self.peer
    }

    /// A raw handle onto the same socket, used by the acceptor to force-close
    /// sessions blocked in a read during shutdown.
    #[inline]
    pub fn shutdown_clone(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Half-close both directions and release the descriptor. Errors are ignored
    /// so the call is safe on an already dead connection.
    #[inline]
    pub fn close(&self) {
        drop(self.stream.shutdown(Shutdown::Both));
    }
}

impl Transport for FramedStream {
    fn send(&mut self, raw: &[u8]) -> NetworkResult<()> {
        send_all(&mut self.stream, raw)
    }

    fn recv_exact(&mut self, count: usize) -> NetworkResult<Vec<u8>> {
        recv_all(&mut self.stream, count)
    }
}

pub(crate) fn send_all<W: Write>(stream: &mut W, raw: &[u8]) -> NetworkResult<()> {
    let mut written = 0;

    while written < raw.len() {
        match stream.write(&raw[written..]) {
            Ok(0) => return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::WriteZero))),
            Ok(count) => written += count,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

pub(crate) fn recv_all<R: Read>(stream: &mut R, count: usize) -> NetworkResult<Vec<u8>> {
    let mut data = vec![0u8; count];
    let mut filled = 0;

    while filled < count {
        match stream.read(&mut data[filled..]) {
            Ok(0) => return Err(NetworkError::Disconnected),
            Ok(read) => filled += read,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err.into()),
        }
    }

    Ok(data)
}
