// ABOUTME: Client module for the MessagePack-RPC library
// ABOUTME: Two calling modes share one wire format: simple (one call in flight) and pipelined (many)

//! Two client shapes, one wire format.
//!
//! * [`simple::SimpleClient`] keeps at most one request in flight at a
//!   time, the direct port of `aiorpc.RPCClient`.
//! * [`pipelined::PipelinedClient`] runs a background reader task so
//!   many callers can share one connection and have their responses
//!   routed back by `msg_id`.
//!
//! ```rust,no_run
//! use msgpack_rpc::client::simple::SimpleClient;
//! use rmpv::Value;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SimpleClient::new_tcp("127.0.0.1:6000");
//! let result = client.call("sum", vec![Value::from(1), Value::from(2)]).await?;
//! # Ok(())
//! # }
//! ```

pub mod pipelined;
pub mod simple;

pub use pipelined::{PipelinedClient, PipelinedClientConfig};
pub use simple::{ScopedConnection, SimpleClient, SimpleClientConfig};
