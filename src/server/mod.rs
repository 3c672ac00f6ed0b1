// ABOUTME: Accept loop and per-connection state machine for the MessagePack-RPC server
// ABOUTME: READ -> VALIDATE -> PARSE -> DISPATCH -> WRITE, one frame at a time, per connection

pub mod registry;

pub use registry::{Handler, HandlerError, HandlerFuture, RegistrationError, Registry, Service};

use crate::codec::{decode_request, pack_response, CodecOptions, ResponseFrame};
use crate::connection::{Connection, Transport};
use crate::error::RpcError;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs, UnixListener};

/// Tuning knobs for a [`Server`]. Mirrors the timeout and packer options
/// `aiorpc.server` used to hold as module globals.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long to wait for a client to send a full request, and for a
    /// write (including a handler's own run time) to complete.
    pub io_timeout: Duration,
    pub codec_options: CodecOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            io_timeout: Duration::from_secs(3),
            codec_options: CodecOptions::default(),
        }
    }
}

/// A fully-configured, immutable server: a method registry plus timeouts.
/// Wrap in `Arc` and hand to [`serve_tcp`]/[`serve_unix`], or drive
/// individual connections directly with [`serve`].
pub struct Server {
    registry: Registry,
    config: ServerConfig,
}

impl Server {
    pub fn new(registry: Registry, config: ServerConfig) -> Self {
        Server { registry, config }
    }
}

enum FrameOutcome {
    Continue,
    CloseConnection,
}

/// Drive one connection to completion: read frames, dispatch each
/// through `server`'s registry, write back a response. Returns once the
/// peer disconnects, a read times out, or a write times out.
pub async fn serve<S>(mut conn: Connection<S>, server: Arc<Server>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let peer = conn.peer().to_string();
    tracing::debug!(peer = %peer, "connection accepted");

    loop {
        let frames = match conn.recv_frames(server.config.io_timeout).await {
            Ok(frames) => frames,
            Err(RpcError::Timeout) => {
                tracing::warn!(peer = %peer, "no request within timeout, closing connection");
                tokio::time::sleep(Duration::from_secs(3)).await;
                conn.close().await;
                break;
            }
            Err(RpcError::ConnectionClosed) => {
                tracing::debug!(peer = %peer, "connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::error!(peer = %peer, error = %e, "failed to read request");
                break;
            }
        };

        let mut should_close = false;
        for raw in frames {
            match handle_request(&mut conn, &server, &peer, raw).await {
                FrameOutcome::Continue => {}
                FrameOutcome::CloseConnection => {
                    should_close = true;
                    break;
                }
            }
        }
        if should_close {
            conn.close().await;
            break;
        }
    }

    tracing::debug!(peer = %peer, "serve loop exited");
}

async fn handle_request<S>(
    conn: &mut Connection<S>,
    server: &Server,
    peer: &str,
    raw: rmpv::Value,
) -> FrameOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = match decode_request(&raw, &server.config.codec_options) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "malformed request, replying with protocol error");
            return write_response(conn, server, peer, ResponseFrame::error(-1, "Invalid protocol")).await;
        }
    };

    let started = Instant::now();
    let msg_id = request.msg_id as i64;
    let method = request.method;

    let response = match server.registry.dispatch(&method, request.params) {
        None => {
            tracing::warn!(peer = %peer, method = %method, "no such method");
            ResponseFrame::enhanced_error(msg_id, "MethodNotFound", format!("No such method {method}"))
        }
        Some(future) => match tokio::time::timeout(server.config.io_timeout, future).await {
            Ok(Ok(value)) => ResponseFrame::ok(msg_id, value),
            Ok(Err(err)) => ResponseFrame::enhanced_error(msg_id, err.kind, err.message),
            Err(_) => ResponseFrame::enhanced_error(msg_id, "Timeout", "Operation timeout"),
        },
    };

    let outcome = write_response(conn, server, peer, response).await;
    tracing::info!(
        peer = %peer,
        method = %method,
        elapsed_us = started.elapsed().as_micros() as u64,
        "call handled"
    );
    outcome
}

async fn write_response<S>(
    conn: &mut Connection<S>,
    server: &Server,
    peer: &str,
    response: ResponseFrame,
) -> FrameOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let bytes = pack_response(&response);
    match conn.send_all(&bytes, server.config.io_timeout).await {
        Ok(()) => FrameOutcome::Continue,
        Err(RpcError::Timeout) => {
            tracing::warn!(peer = %peer, "write timed out, closing connection");
            FrameOutcome::CloseConnection
        }
        Err(e) => {
            tracing::error!(peer = %peer, error = %e, "failed to write response");
            FrameOutcome::Continue
        }
    }
}

/// Bind `addr` and accept TCP connections forever, spawning [`serve`] on
/// each one. Returns only if the listener itself fails to bind.
pub async fn serve_tcp(addr: impl ToSocketAddrs, server: Arc<Server>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(local_addr = ?listener.local_addr().ok(), "listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let conn = match Connection::from_tcp(stream) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "failed to prepare accepted connection");
                continue;
            }
        };
        tokio::spawn(serve(conn, Arc::clone(&server)));
    }
}

/// Bind `path` as a Unix domain socket and accept connections forever.
pub async fn serve_unix(path: impl AsRef<Path>, server: Arc<Server>) -> io::Result<()> {
    let listener = UnixListener::bind(path)?;
    tracing::info!("listening on unix socket");
    loop {
        let (stream, _) = listener.accept().await?;
        let conn = Connection::<Transport>::from_unix(stream);
        tokio::spawn(serve(conn, Arc::clone(&server)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_response, pack_request};
    use registry::HandlerError;
    use rmpv::Value;
    use tokio::io::duplex;

    fn make_server() -> Arc<Server> {
        let mut registry = Registry::new();
        registry
            .register("echo", |mut args: Vec<Value>| {
                Box::pin(async move { Ok(args.pop().unwrap_or(Value::Nil)) })
            })
            .unwrap();
        registry
            .register("boom", |_args: Vec<Value>| {
                Box::pin(async move { Err(HandlerError::with_kind("Boom", "it broke")) })
            })
            .unwrap();
        Arc::new(Server::new(registry, ServerConfig::default()))
    }

    #[tokio::test]
    async fn echoes_a_successful_call() {
        let (client, server_stream) = duplex(4096);
        let server = make_server();
        tokio::spawn(serve(Connection::new(server_stream, "test"), server));

        let mut client_conn = Connection::new(client, "client");
        let bytes = pack_request(7, "echo", &[Value::String("hi".into())]);
        client_conn.send_all(&bytes, Duration::from_secs(1)).await.unwrap();

        let frames = client_conn.recv_frames(Duration::from_secs(1)).await.unwrap();
        let response = decode_response(&frames[0], &CodecOptions::default()).unwrap();
        assert_eq!(response.msg_id, 7);
        assert_eq!(response.result, Some(Value::String("hi".into())));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn handler_error_becomes_enhanced_error_response() {
        let (client, server_stream) = duplex(4096);
        let server = make_server();
        tokio::spawn(serve(Connection::new(server_stream, "test"), server));

        let mut client_conn = Connection::new(client, "client");
        let bytes = pack_request(1, "boom", &[]);
        client_conn.send_all(&bytes, Duration::from_secs(1)).await.unwrap();

        let frames = client_conn.recv_frames(Duration::from_secs(1)).await.unwrap();
        let response = decode_response(&frames[0], &CodecOptions::default()).unwrap();
        assert_eq!(
            response.error,
            Some(Value::Array(vec![
                Value::String("Boom".into()),
                Value::String("it broke".into()),
            ]))
        );
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found_response() {
        let (client, server_stream) = duplex(4096);
        let server = make_server();
        tokio::spawn(serve(Connection::new(server_stream, "test"), server));

        let mut client_conn = Connection::new(client, "client");
        let bytes = pack_request(1, "missing", &[]);
        client_conn.send_all(&bytes, Duration::from_secs(1)).await.unwrap();

        let frames = client_conn.recv_frames(Duration::from_secs(1)).await.unwrap();
        let response = decode_response(&frames[0], &CodecOptions::default()).unwrap();
        let error = response.error.unwrap();
        let kind = error.as_array().unwrap()[0].as_str().unwrap();
        assert_eq!(kind, "MethodNotFound");
    }

    #[tokio::test]
    async fn malformed_frame_gets_invalid_protocol_response() {
        let (client, server_stream) = duplex(4096);
        let server = make_server();
        tokio::spawn(serve(Connection::new(server_stream, "test"), server));

        let mut client_conn = Connection::new(client, "client");
        let bytes = crate::codec::encode(&Value::Integer(42.into()));
        client_conn.send_all(&bytes, Duration::from_secs(1)).await.unwrap();

        let frames = client_conn.recv_frames(Duration::from_secs(1)).await.unwrap();
        let response = decode_response(&frames[0], &CodecOptions::default()).unwrap();
        assert_eq!(response.msg_id, -1);
        assert_eq!(response.error, Some(Value::String("Invalid protocol".into())));
    }
}
