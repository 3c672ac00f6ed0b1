//! End-to-end scenarios exercising a real server against both client modes.

use crate::client::simple::SimpleClient;
use crate::connection::Connection;
use crate::server::{serve, HandlerError, Registry, Server, ServerConfig, Service};
use rmpv::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn spawn_server(registry: Registry, config: ServerConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(Server::new(registry, config));
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = Connection::from_tcp(stream).unwrap();
            tokio::spawn(serve(conn, Arc::clone(&server)));
        }
    });
    addr
}

fn echo_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("echo", |mut args: Vec<Value>| {
            Box::pin(async move { Ok(args.pop().unwrap_or(Value::Nil)) })
        })
        .unwrap();
    registry
}

#[tokio::test]
async fn echo_round_trips_through_the_simple_client() {
    let addr = spawn_server(echo_registry(), ServerConfig::default()).await;
    let mut client = SimpleClient::new_tcp(addr);
    let result = client
        .call("echo", vec![Value::String("hello".into())])
        .await
        .unwrap();
    assert_eq!(result, Value::String("hello".into()));
}

#[tokio::test]
async fn server_side_exception_surfaces_as_enhanced_error() {
    let mut registry = Registry::new();
    registry
        .register("divide", |args: Vec<Value>| {
            Box::pin(async move {
                let denominator = args.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
                if denominator == 0 {
                    return Err(HandlerError::with_kind("ZeroDivisionError", "division by zero"));
                }
                let numerator = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(Value::from(numerator / denominator))
            })
        })
        .unwrap();

    let addr = spawn_server(registry, ServerConfig::default()).await;
    let mut client = SimpleClient::new_tcp(addr);
    let err = client
        .call("divide", vec![Value::from(1), Value::from(0)])
        .await
        .unwrap_err();

    match err {
        crate::error::RpcError::Enhanced { kind, message } => {
            assert_eq!(kind, "ZeroDivisionError");
            assert_eq!(message, "division by zero");
        }
        other => panic!("expected an enhanced error, got {other:?}"),
    }
}

#[tokio::test]
async fn client_read_times_out_when_server_never_answers() {
    let mut registry = Registry::new();
    registry
        .register("hang", |_args: Vec<Value>| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Nil)
            })
        })
        .unwrap();

    let config = ServerConfig {
        io_timeout: Duration::from_secs(10),
        ..ServerConfig::default()
    };
    let addr = spawn_server(registry, config).await;

    let mut client = SimpleClient::new_tcp(addr).with_config(
        crate::client::simple::SimpleClientConfig {
            io_timeout: Duration::from_millis(50),
            codec_options: Default::default(),
        },
    );
    let err = client.call("hang", vec![]).await.unwrap_err();
    assert!(matches!(err, crate::error::RpcError::Timeout));
}

#[tokio::test]
async fn call_once_reopens_a_fresh_connection_each_time() {
    let addr = spawn_server(echo_registry(), ServerConfig::default()).await;
    let mut client = SimpleClient::new_tcp(addr);

    let first = client
        .call_once("echo", vec![Value::from(1)])
        .await
        .unwrap();
    assert!(!client.is_open());
    let second = client
        .call_once("echo", vec![Value::from(2)])
        .await
        .unwrap();
    assert!(!client.is_open());

    assert_eq!(first, Value::from(1));
    assert_eq!(second, Value::from(2));
}

struct Calculator;

impl Service for Calculator {
    fn call(&self, method: &str, params: Vec<Value>) -> crate::server::HandlerFuture {
        let a = params.first().and_then(|v| v.as_i64()).unwrap_or(0);
        let b = params.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
        match method {
            "add" => Box::pin(async move { Ok(Value::from(a + b)) }),
            "sub" => Box::pin(async move { Ok(Value::from(a - b)) }),
            other => {
                let other = other.to_string();
                Box::pin(async move { Err(HandlerError::new(format!("no such method {other}"))) })
            }
        }
    }
}

#[tokio::test]
async fn dotted_method_names_dispatch_to_a_registered_service() {
    let mut registry = Registry::new();
    registry.register_service("Calculator", Calculator).unwrap();
    let addr = spawn_server(registry, ServerConfig::default()).await;

    let mut client = SimpleClient::new_tcp(addr);
    let sum = client
        .call("Calculator.add", vec![Value::from(2), Value::from(3)])
        .await
        .unwrap();
    assert_eq!(sum, Value::from(5));
}

#[tokio::test]
async fn unix_socket_transport_behaves_like_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rpc.sock");

    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let server = Arc::new(Server::new(echo_registry(), ServerConfig::default()));
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = Connection::from_unix(stream);
            tokio::spawn(serve(conn, Arc::clone(&server)));
        }
    });

    let mut client = SimpleClient::new_unix(path);
    let result = client
        .call("echo", vec![Value::String("over unix".into())])
        .await
        .unwrap();
    assert_eq!(result, Value::String("over unix".into()));
}

#[tokio::test]
async fn pipelined_calls_each_receive_their_own_response_out_of_order() {
    use crate::client::pipelined::PipelinedClient;

    let mut registry = Registry::new();
    registry
        .register("delay_then_echo", |args: Vec<Value>| {
            Box::pin(async move {
                let millis = args.first().and_then(|v| v.as_u64()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(args.into_iter().nth(1).unwrap_or(Value::Nil))
            })
        })
        .unwrap();
    let addr = spawn_server(registry, ServerConfig::default()).await;

    // `call` takes `&self`, so many tasks can share one connection
    // through a plain `Arc` with no lock serializing their round trips.
    let client = Arc::new(PipelinedClient::new_tcp(addr));

    let slow = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("delay_then_echo", vec![Value::from(50), Value::from("slow")])
                .await
        })
    };
    // Give the slow call's request a head start onto the wire so the
    // server is already processing it before the fast one is sent.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("delay_then_echo", vec![Value::from(0), Value::from("fast")])
                .await
        })
    };

    assert_eq!(fast.await.unwrap().unwrap(), Value::from("fast"));
    assert_eq!(slow.await.unwrap().unwrap(), Value::from("slow"));
}
