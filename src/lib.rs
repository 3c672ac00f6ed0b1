//! A MessagePack-RPC client and server library over TCP and Unix domain sockets.
//!
//! The wire format is the MessagePack-RPC v0 request/response tuple pair:
//! `(0, msg_id, method, params)` and `(1, msg_id, error, result)`. See
//! [`codec`] for the framing and [`connection`] for how frames are read
//! off a socket.
//!
//! ## Server
//!
//! ```rust,no_run
//! use msgpack_rpc::server::{Registry, Server, ServerConfig, serve_tcp};
//! use rmpv::Value;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = Registry::new();
//!     registry.register("sum", |args: Vec<Value>| {
//!         Box::pin(async move {
//!             let total: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
//!             Ok(Value::from(total))
//!         })
//!     })?;
//!
//!     let server = Arc::new(Server::new(registry, ServerConfig::default()));
//!     serve_tcp("127.0.0.1:6000", server).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Client
//!
//! ```rust,no_run
//! use msgpack_rpc::client::simple::SimpleClient;
//! use rmpv::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = SimpleClient::new_tcp("127.0.0.1:6000");
//!     let result = client.call("sum", vec![Value::from(1), Value::from(2)]).await?;
//!     println!("{result:?}");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod pool;
pub mod server;

#[cfg(test)]
mod tests;

pub use codec::{CodecError, CodecOptions, RequestFrame, ResponseFrame};
pub use connection::{Connection, Transport};
pub use error::{RpcError, RpcResult};
pub use pool::{ConnectionPool, PooledConnection};
pub use server::{Registry, Server, ServerConfig};

pub use rmpv::Value;

/// Error type used by example binaries and doctests.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Convenience result alias for the same.
pub type Result<T> = std::result::Result<T, Error>;
