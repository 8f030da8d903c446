//! External endpoint core for the Petrel helper protocol.
//!
//! An [`ExternalEndpoint`] manages one connected worker: an IPC child
//! launched over a pipe pair ([`ExternalEndpoint::run_ipc`]) or a remote
//! peer over TCP ([`ExternalEndpoint::attach_tcp_socket`]). The endpoint
//! owns the framed read loop, the sequenced write path, the built-in
//! command handlers (messages, ping/pong, shutdown, HTTP proxying, event
//! bus), a ping/pong watchdog, and a single idempotent teardown path.
//!
//! The daemon's services — message bus, IPC tracker, web server, event
//! bus — are injected through the collaborator traits re-exported at the
//! crate root; the wire protocol lives in `petrel-proto`.
//!
//! # Example
//!
//! ```ignore
//! use petrel_external::{Collaborators, ExternalConfig, ExternalEndpoint};
//!
//! let endpoint = ExternalEndpoint::new(ExternalConfig::default(), collaborators);
//! endpoint.set_binary("petrel_cap_linuxwifi", vec![]).await;
//! endpoint.run_ipc().await?;
//! ```

mod config;
mod endpoint;
mod error;
mod event_bridge;
mod http_bridge;
pub mod launcher;
mod traits;
mod transport;
mod watchdog;

pub use config::{ConfigError, ExternalConfig};
pub use endpoint::{ClosureCallback, ErrorCallback, ExternalEndpoint};
pub use error::{EndpointError, LaunchStage};
pub use traits::{
    BusEvent, Collaborators, CommandHook, ConnectionError, EventBus, EventListener, HttpConnection,
    HttpServer, IpcCallback, IpcRecord, IpcTracker, MessageBus, Role, RouteHandler,
    EVENT_JSON_FIELD,
};
pub use transport::{TransportKind, WriteCallback, WriteCompletion};
