// ABOUTME: Minimal MessagePack-RPC server exposing a single "echo" method
// ABOUTME: Run with `cargo run --example echo_server`, pair with `echo_client`

use msgpack_rpc::server::{serve_tcp, Registry, Server, ServerConfig};
use rmpv::Value;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut registry = Registry::new();
    registry.register("echo", |mut args: Vec<Value>| {
        Box::pin(async move { Ok(args.pop().unwrap_or(Value::Nil)) })
    })?;

    let server = Arc::new(Server::new(registry, ServerConfig::default()));
    tracing::info!("listening on 127.0.0.1:6000");
    serve_tcp("127.0.0.1:6000", server).await?;
    Ok(())
}
