// ABOUTME: Minimal MessagePack-RPC client calling the "echo" method
// ABOUTME: Run with `cargo run --example echo_client`, pair with `echo_server`

use msgpack_rpc::client::simple::SimpleClient;
use rmpv::Value;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut client = SimpleClient::new_tcp("127.0.0.1:6000");
    let result = client
        .call("echo", vec![Value::String("hello, rpc".into())])
        .await?;
    println!("server replied: {result:?}");

    client.close().await;
    Ok(())
}
