//! Collaborator seams owned by the host daemon.
//!
//! The endpoint core only depends on these contracts; the daemon injects
//! its message bus, IPC tracker, web server, and event bus as
//! `Arc<dyn …>` at construction.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

/// Callback invoked by the IPC tracker when a registered child closes or
/// errors. Carries a human-readable reason.
pub type IpcCallback = Arc<dyn Fn(String) + Send + Sync>;

/// A child process registered with the daemon's IPC tracker.
pub struct IpcRecord {
    pub pid: i32,
    pub on_close: IpcCallback,
    pub on_error: IpcCallback,
}

impl std::fmt::Debug for IpcRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcRecord").field("pid", &self.pid).finish()
    }
}

/// Daemon-wide message bus sink.
pub trait MessageBus: Send + Sync {
    fn publish(&self, text: &str, flags: u32);
}

/// Tracker that owns child-process reaping for the daemon.
pub trait IpcTracker: Send + Sync {
    fn register(&self, record: IpcRecord);

    fn remove(&self, pid: i32);
}

/// Access role required for a route or minted token.
///
/// Proxied routes and worker-minted tokens are always bound to the
/// logged-on role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Any logged-on user.
    LogOn,
}

/// Error surfaced by an HTTP connection when response state cannot be
/// applied (e.g. headers after body bytes have been written).
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ConnectionError(pub String);

/// One in-flight request on the daemon's web server.
///
/// Response parts must be applied in order: headers, then status, then
/// body bytes, then completion.
pub trait HttpConnection: Send + Sync {
    fn uri(&self) -> String;

    fn method(&self) -> String;

    /// Query and form variables of the request.
    fn http_variables(&self) -> HashMap<String, String>;

    fn append_header(&self, name: &str, value: &str) -> Result<(), ConnectionError>;

    fn set_status(&self, code: u16) -> Result<(), ConnectionError>;

    /// Appends bytes to the response stream.
    fn put_data(&self, data: &[u8]);

    /// Marks the response stream complete.
    fn complete(&self);

    /// Cancels the response stream, failing the request.
    fn cancel(&self);

    /// Installs a callback fired if the client disconnects before the
    /// response completes.
    fn set_closure_cb(&self, cb: Box<dyn FnOnce() + Send>);
}

/// Handler attached to a registered route.
pub type RouteHandler = Arc<
    dyn Fn(Arc<dyn HttpConnection>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// The daemon's web server.
pub trait HttpServer: Send + Sync {
    fn register_route(&self, uri: &str, method: &str, role: Role, handler: RouteHandler);

    /// Mints a session token for the given role. A `ttl_secs` of zero
    /// means no expiry.
    fn create_auth(&self, name: &str, role: Role, ttl_secs: u64) -> String;
}

/// Well-known field under which worker-published JSON is attached to a
/// bus event.
pub const EVENT_JSON_FIELD: &str = "petrel.eventbus.event_json";

/// An event travelling on the daemon event bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub event_type: String,
    pub content: serde_json::Map<String, serde_json::Value>,
}

impl BusEvent {
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            content: serde_json::Map::new(),
        }
    }
}

/// Listener callback registered with the event bus.
pub type EventListener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// The daemon's event bus.
pub trait EventBus: Send + Sync {
    /// Registers a listener for a named event, returning its listener id.
    fn register_listener(&self, event: &str, listener: EventListener) -> u64;

    fn remove_listener(&self, id: u64);

    /// Builds an empty event of the given type.
    fn event(&self, event_type: &str) -> BusEvent;

    fn publish(&self, event: BusEvent);
}

/// Extension dispatch hook for commands outside the built-in table.
///
/// Returns `true` when the command was handled; unhandled commands are
/// dropped for forward compatibility with newer workers.
#[async_trait::async_trait]
pub trait CommandHook: Send + Sync {
    async fn dispatch(&self, command: &petrel_proto::Command) -> bool;
}

/// The collaborator set injected into an endpoint.
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn MessageBus>,
    pub tracker: Arc<dyn IpcTracker>,
    pub httpd: Arc<dyn HttpServer>,
    pub eventbus: Arc<dyn EventBus>,
}
