// ABOUTME: Simple MessagePack-RPC client — one in-flight request per connection
// ABOUTME: Lazy-opens on first call, closeable explicitly via call_once or a scoped guard

use crate::codec::{decode_response, pack_request, CodecOptions};
use crate::connection::{Connection, Transport};
use crate::error::{RpcError, RpcResult};
use rmpv::Value;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};

/// Timeouts and packer options for [`SimpleClient`].
#[derive(Debug, Clone)]
pub struct SimpleClientConfig {
    pub io_timeout: Duration,
    pub codec_options: CodecOptions,
}

impl Default for SimpleClientConfig {
    fn default() -> Self {
        SimpleClientConfig {
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

/// A request/response client that keeps at most one call in flight at a
/// time over a single connection, the Rust analogue of `aiorpc.RPCClient`.
pub struct SimpleClient {
    target: Target,
    config: SimpleClientConfig,
    conn: Option<Connection<Transport>>,
    next_msg_id: u64,
}

impl SimpleClient {
    pub fn new_tcp(addr: impl Into<String>) -> Self {
        SimpleClient {
            target: Target::Tcp(addr.into()),
            config: SimpleClientConfig::default(),
            conn: None,
            next_msg_id: 0,
        }
    }

    pub fn new_unix(path: impl Into<PathBuf>) -> Self {
        SimpleClient {
            target: Target::Unix(path.into()),
            config: SimpleClientConfig::default(),
            conn: None,
            next_msg_id: 0,
        }
    }

    pub fn with_config(mut self, config: SimpleClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn ensure_open(&mut self) -> RpcResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = match &self.target {
            Target::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                Connection::from_tcp(stream)?
            }
            Target::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Connection::from_unix(stream)
            }
        };
        self.conn = Some(conn);
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        self.next_msg_id
    }

    /// Issue a call and wait for its matching response, opening the
    /// connection first if it isn't already.
    ///
    /// Takes the connection out of `self` for the duration of the call
    /// and puts it back only on success, so a failed call always leaves
    /// the client closed rather than holding a socket in an unknown state.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        self.ensure_open().await?;
        let msg_id = self.next_id();
        let request = pack_request(msg_id, method, &params);
        let mut conn = self.conn.take().expect("ensure_open just populated conn");

        let result = Self::run_call(&mut conn, &self.config, msg_id, &request).await;
        if result.is_ok() {
            self.conn = Some(conn);
        }
        result
    }

    async fn run_call(
        conn: &mut Connection<Transport>,
        config: &SimpleClientConfig,
        msg_id: u64,
        request: &[u8],
    ) -> RpcResult<Value> {
        conn.send_all(request, config.io_timeout).await?;

        loop {
            let frames = conn.recv_frames(config.io_timeout).await?;
            for raw in frames {
                let response = decode_response(&raw, &config.codec_options)
                    .map_err(|e| RpcError::Protocol(e.to_string()))?;
                if response.msg_id != msg_id as i64 {
                    return Err(RpcError::InvalidMessageId);
                }
                return match response.error {
                    Some(Value::Array(parts)) if parts.len() == 2 => Err(RpcError::Enhanced {
                        kind: parts[0].as_str().unwrap_or_default().to_string(),
                        message: parts[1].as_str().unwrap_or_default().to_string(),
                    }),
                    Some(other) => Err(RpcError::Generic(other.to_string())),
                    None => Ok(response.result.unwrap_or(Value::Nil)),
                };
            }
        }
    }

    /// Issue a call, then close the connection regardless of outcome.
    pub async fn call_once(&mut self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        let result = self.call(method, params).await;
        self.close().await;
        result
    }

    /// Close the connection, if any is open. The client reopens lazily
    /// on the next `call`.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// Borrow a guard that opens the connection now and closes it when
    /// dropped, the Rust analogue of `async with RPCClient(...) as client`.
    pub async fn with_connection(&mut self) -> RpcResult<ScopedConnection<'_>> {
        self.ensure_open().await?;
        Ok(ScopedConnection { client: self })
    }
}

/// RAII guard returned by [`SimpleClient::with_connection`]. Dropping it
/// drops the underlying socket, closing the connection.
pub struct ScopedConnection<'a> {
    client: &'a mut SimpleClient,
}

impl Deref for ScopedConnection<'_> {
    type Target = SimpleClient;
    fn deref(&self) -> &SimpleClient {
        self.client
    }
}

impl DerefMut for ScopedConnection<'_> {
    fn deref_mut(&mut self) -> &mut SimpleClient {
        self.client
    }
}

impl Drop for ScopedConnection<'_> {
    fn drop(&mut self) {
        self.client.conn = None;
    }
}
