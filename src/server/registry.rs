// ABOUTME: Method registry for the MessagePack-RPC server — free handlers and registered services
// ABOUTME: Populated once before serve() starts accepting connections, then read-only

use rmpv::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The future type every handler and service method returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// A free-standing handler: `fn(args) -> value | Future<value>`, expressed
/// uniformly as an `Fn` returning a boxed future so sync and async
/// handlers share one registration path.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Error produced by a handler. `kind` becomes the enhanced-error tag
/// sent back to the caller; `Error` is the catch-all for handlers that
/// don't care to name themselves.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            kind: "Error".to_string(),
            message: message.into(),
        }
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Argument count didn't match what the handler expected.
    pub fn arity_mismatch(expected: usize, actual: usize) -> Self {
        HandlerError::with_kind(
            "TypeError",
            format!("expected {expected} argument(s), got {actual}"),
        )
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A registered instance whose methods are reachable as `"Name.method"`.
///
/// The Rust analogue of `registerClass`: instantiate once, store behind
/// a trait object, and dispatch by splitting the method name on the
/// first `.`.
pub trait Service: Send + Sync {
    fn call(&self, method: &str, params: Vec<Value>) -> HandlerFuture;
}

/// Error produced when a registration is rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistrationError {
    #[error("Name {0} has already been used")]
    DuplicateHandler(String),
    #[error("Service {0} has already been registered")]
    DuplicateService(String),
}

/// Maps method names to handlers. Built once before `serve` begins
/// accepting connections; read-only thereafter, so no locking is
/// needed once wrapped in `Arc<Server>`.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, Handler>,
    services: HashMap<String, Arc<dyn Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a free handler under `name`. Rejects duplicate names —
    /// registration happens once at startup, so this is treated as a
    /// configuration error, not a runtime one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Value>) -> HandlerFuture + Send + Sync + 'static,
    ) -> Result<(), RegistrationError> {
        let name = name.into();
        if self.handlers.contains_key(&name) || self.services.contains_key(&name) {
            return Err(RegistrationError::DuplicateHandler(name));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Register a service instance, reachable as `"name.method"`.
    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        service: impl Service + 'static,
    ) -> Result<(), RegistrationError> {
        let name = name.into();
        if self.services.contains_key(&name) {
            return Err(RegistrationError::DuplicateService(name));
        }
        self.services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Resolve `method_name` to an invocable future. No `.` in the name
    /// looks up a free handler; otherwise the first segment names a
    /// registered service and the remainder is its method name.
    pub fn dispatch(&self, method_name: &str, params: Vec<Value>) -> Option<HandlerFuture> {
        match method_name.split_once('.') {
            None => self.handlers.get(method_name).map(|h| h(params)),
            Some((service_name, method)) => self
                .services
                .get(service_name)
                .map(|service| service.call(method, params)),
        }
    }
}
