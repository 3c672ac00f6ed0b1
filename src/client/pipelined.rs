// ABOUTME: Pipelined MessagePack-RPC client — many in-flight requests over one connection
// ABOUTME: A background task reads responses and routes each to its waiting caller by msg_id

use crate::codec::{decode_response, pack_request, CodecOptions, Decoder, SOCKET_RECV_SIZE};
use crate::connection::Transport;
use crate::error::{RpcError, RpcResult};
use rmpv::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Lazily-opened connection state, shared across concurrent `call`s
/// through a brief lock that never spans a full round trip.
#[derive(Default)]
struct OpenState {
    shared: Option<Arc<Shared>>,
    reader_handle: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct PipelinedClientConfig {
    pub io_timeout: Duration,
    pub codec_options: CodecOptions,
}

impl Default for PipelinedClientConfig {
    fn default() -> Self {
        PipelinedClientConfig {
            io_timeout: Duration::from_secs(3),
            codec_options: CodecOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    Tcp(String),
    Unix(PathBuf),
}

type Pending = HashMap<u64, oneshot::Sender<RpcResult<Value>>>;

struct Shared {
    writer: Mutex<WriteHalf<Transport>>,
    pending: Mutex<Pending>,
    next_msg_id: AtomicU64,
}

/// Why the reader loop stopped, broadcast to every caller still waiting
/// on a response (the reader itself can't clone `RpcError`, so this is
/// the value it keeps around instead).
#[derive(Clone)]
enum ReaderFailure {
    Closed,
    Protocol(String),
    Io(String),
}

impl ReaderFailure {
    fn into_rpc_error(self) -> RpcError {
        match self {
            ReaderFailure::Closed => RpcError::ConnectionClosed,
            ReaderFailure::Protocol(msg) => RpcError::Protocol(msg),
            ReaderFailure::Io(msg) => RpcError::Generic(msg),
        }
    }
}

/// A client that allows many requests in flight at once over a single
/// connection. Spec.md §4.6's multi-request mode: this crate's answer
/// since nothing pipelines requests in the original implementation.
///
/// `call` takes `&self`: the only mutable state is the lazily-opened
/// connection, guarded by a lock that's held just long enough to open
/// or clone it, never across a caller's full round trip. That's what
/// lets many `call`s on an `Arc<PipelinedClient>` actually stay in
/// flight together instead of serializing behind one lock.
pub struct PipelinedClient {
    target: Target,
    config: PipelinedClientConfig,
    state: Mutex<OpenState>,
}

impl PipelinedClient {
    pub fn new_tcp(addr: impl Into<String>) -> Self {
        PipelinedClient {
            target: Target::Tcp(addr.into()),
            config: PipelinedClientConfig::default(),
            state: Mutex::new(OpenState::default()),
        }
    }

    pub fn new_unix(path: impl Into<PathBuf>) -> Self {
        PipelinedClient {
            target: Target::Unix(path.into()),
            config: PipelinedClientConfig::default(),
            state: Mutex::new(OpenState::default()),
        }
    }

    pub fn with_config(mut self, config: PipelinedClientConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.shared.is_some()
    }

    /// Return the shared connection state, opening a fresh connection
    /// first if none is open yet. Holds `state`'s lock only for the
    /// duration of the check (and, the first time, the connect).
    async fn ensure_open(&self) -> RpcResult<Arc<Shared>> {
        let mut state = self.state.lock().await;
        if let Some(shared) = &state.shared {
            return Ok(Arc::clone(shared));
        }

        let transport = match &self.target {
            Target::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Transport::Tcp(stream)
            }
            Target::Unix(path) => Transport::Unix(UnixStream::connect(path).await?),
        };
        let (read_half, write_half) = split(transport);
        let shared = Arc::new(Shared {
            writer: Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_msg_id: AtomicU64::new(0),
        });
        let reader_shared = Arc::clone(&shared);
        let codec_options = self.config.codec_options.clone();
        let handle = tokio::spawn(run_reader(read_half, reader_shared, codec_options));
        state.shared = Some(Arc::clone(&shared));
        state.reader_handle = Some(handle);
        Ok(shared)
    }

    /// Send a request and await its matching response. Safe to call
    /// concurrently — e.g. from many tasks sharing one
    /// `Arc<PipelinedClient>` — since each call only holds the
    /// connection lock long enough to open it, then owns nothing but
    /// its own oneshot slot until its response (or timeout) arrives.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        let shared = self.ensure_open().await?;
        let msg_id = shared.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1;

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(msg_id, tx);

        let request = pack_request(msg_id, method, &params);
        let write_result = {
            let mut writer = shared.writer.lock().await;
            match writer.write_all(&request).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = write_result {
            shared.pending.lock().await.remove(&msg_id);
            return Err(RpcError::Io(e));
        }

        match tokio::time::timeout(self.config.io_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                shared.pending.lock().await.remove(&msg_id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Stop the background reader and drop the connection. Pending
    /// calls already awaiting a response resolve with
    /// `RpcError::ConnectionClosed` once the reader task unwinds;
    /// aborting it here resolves them immediately instead.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.reader_handle.take() {
            handle.abort();
        }
        if let Some(shared) = state.shared.take() {
            let mut pending = shared.pending.lock().await;
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(RpcError::ConnectionClosed));
            }
        }
    }
}

async fn run_reader(mut read_half: ReadHalf<Transport>, shared: Arc<Shared>, codec_options: CodecOptions) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; SOCKET_RECV_SIZE];
    loop {
        loop {
            match decoder.next() {
                Ok(Some(raw)) => match decode_response(&raw, &codec_options) {
                    Ok(response) => {
                        let mut pending = shared.pending.lock().await;
                        if let Some(sender) = pending.remove(&(response.msg_id as u64)) {
                            let result = match response.error {
                                Some(Value::Array(parts)) if parts.len() == 2 => Err(RpcError::Enhanced {
                                    kind: parts[0].as_str().unwrap_or_default().to_string(),
                                    message: parts[1].as_str().unwrap_or_default().to_string(),
                                }),
                                Some(other) => Err(RpcError::Generic(other.to_string())),
                                None => Ok(response.result.unwrap_or(Value::Nil)),
                            };
                            let _ = sender.send(result);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed response frame");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    fail_all_pending(&shared, ReaderFailure::Protocol(e.to_string())).await;
                    return;
                }
            }
        }

        match read_half.read(&mut buf).await {
            Ok(0) => {
                fail_all_pending(&shared, ReaderFailure::Closed).await;
                return;
            }
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) => {
                fail_all_pending(&shared, ReaderFailure::Io(e.to_string())).await;
                return;
            }
        }
    }
}

async fn fail_all_pending(shared: &Shared, reason: ReaderFailure) {
    let mut pending = shared.pending.lock().await;
    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(reason.clone().into_rpc_error()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::server::{serve, Registry, Server, ServerConfig};
    use tokio::net::TcpListener;

    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut registry = Registry::new();
        registry
            .register("echo", |mut args: Vec<Value>| {
                Box::pin(async move { Ok(args.pop().unwrap_or(Value::Nil)) })
            })
            .unwrap();
        let server = Arc::new(Server::new(registry, ServerConfig::default()));
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let conn = Connection::from_tcp(stream).unwrap();
                tokio::spawn(serve(conn, Arc::clone(&server)));
            }
        });
        addr
    }

    #[tokio::test]
    async fn single_call_round_trips() {
        let addr = spawn_echo_server().await;
        let client = PipelinedClient::new_tcp(addr);
        let result = client.call("echo", vec![Value::Integer(42.into())]).await.unwrap();
        assert_eq!(result, Value::Integer(42.into()));
    }

    #[tokio::test]
    async fn many_concurrent_calls_each_get_their_own_response() {
        let addr = spawn_echo_server().await;
        let client = Arc::new(PipelinedClient::new_tcp(addr));

        let mut handles = Vec::new();
        for i in 0..16 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.call("echo", vec![Value::Integer(i.into())]).await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert_eq!(result, Value::Integer((i as i64).into()));
        }
    }

    #[tokio::test]
    async fn close_resolves_pending_calls_with_connection_closed() {
        let addr = spawn_echo_server().await;
        let client = PipelinedClient::new_tcp(addr);
        client.call("echo", vec![Value::Nil]).await.unwrap();
        assert!(client.is_open().await);
        client.close().await;
        assert!(!client.is_open().await);
    }
}
