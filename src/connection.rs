// ABOUTME: Frame-based connection management for MessagePack-RPC over TCP or Unix sockets
// ABOUTME: Owns a buffered stream and a streaming decoder; timeouts wrap every blocking I/O call

use crate::codec::{Decoder, SOCKET_RECV_SIZE};
use crate::error::RpcError;
use rmpv::Value;
use socket2::SockRef;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// Unifies the two transports this crate supports so that `Connection`,
/// the server accept loop, and the client can all be transport-agnostic.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    /// A human-readable peer description, used only for logging.
    pub fn peer_description(&self) -> String {
        match self {
            Transport::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            Transport::Unix(_) => "unix socket".to_string(),
        }
    }

    /// Enable `SO_KEEPALIVE` on the underlying socket. Unix domain sockets
    /// have no notion of TCP keepalive and are left untouched.
    pub fn enable_keepalive(&self) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => {
                SockRef::from(stream).set_keepalive(true)?;
                Ok(())
            }
            Transport::Unix(_) => Ok(()),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A connection's transport plus the decoder state needed to pull whole
/// frames out of an arbitrarily-chunked byte stream.
///
/// Generic over the stream type so tests can exercise `Connection` over
/// an in-memory duplex pipe without going through a real socket.
pub struct Connection<S = Transport> {
    stream: BufWriter<S>,
    decoder: Decoder,
    recv_chunk: usize,
    peer: String,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Connection {
            stream: BufWriter::new(stream),
            decoder: Decoder::new(),
            recv_chunk: SOCKET_RECV_SIZE,
            peer: peer.into(),
            closed: false,
        }
    }

    /// Override the per-read chunk size (`SOCKET_RECV_SIZE` by default).
    pub fn with_recv_chunk(mut self, bytes: usize) -> Self {
        self.recv_chunk = bytes;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `bytes` and flush, under `timeout`.
    pub async fn send_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), RpcError> {
        let write = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RpcError::Io(e)),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Read until at least one complete frame has been decoded, then
    /// return every frame that emerged from the most recent read. A
    /// single read may surface more than one frame (back-to-back
    /// requests in one TCP segment) or a partial one (none yet).
    pub async fn recv_frames(&mut self, timeout: Duration) -> Result<Vec<Value>, RpcError> {
        let mut frame_buf = [0u8; SOCKET_RECV_SIZE];
        loop {
            let mut frames = Vec::new();
            loop {
                match self.decoder.next() {
                    Ok(Some(value)) => frames.push(value),
                    Ok(None) => break,
                    Err(e) => return Err(RpcError::Protocol(e.to_string())),
                }
            }
            if !frames.is_empty() {
                return Ok(frames);
            }

            let read = &mut frame_buf[..self.recv_chunk.min(frame_buf.len())];
            let n = match tokio::time::timeout(timeout, self.stream.read(read)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(RpcError::Io(e)),
                Err(_) => return Err(RpcError::Timeout),
            };

            if n == 0 {
                return Err(RpcError::ConnectionClosed);
            }
            self.decoder.feed(&read[..n]);
        }
    }

    /// Mark the connection closed and shut the writer down.
    pub async fn close(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }
}

impl Connection<Transport> {
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let transport = Transport::Tcp(stream);
        transport.enable_keepalive()?;
        let peer = transport.peer_description();
        Ok(Connection::new(transport, peer))
    }

    pub fn from_unix(stream: UnixStream) -> Self {
        let transport = Transport::Unix(stream);
        let peer = transport.peer_description();
        Connection::new(transport, peer)
    }
}
