//! Error types for the external endpoint.

use thiserror::Error;

/// Stage at which an IPC launch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    /// No candidate binary found on the search path.
    MissingBinary,
    /// A candidate exists but is not executable by the current user.
    Permissions,
    /// Pipe creation failed.
    Pipe,
    /// Spawning the child process failed.
    Spawn,
}

impl std::fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBinary => write!(f, "missing binary"),
            Self::Permissions => write!(f, "permissions"),
            Self::Pipe => write!(f, "pipe"),
            Self::Spawn => write!(f, "spawn"),
        }
    }
}

/// Endpoint errors.
///
/// Every recoverable runtime kind funnels through `trigger_error`, which
/// guarantees exactly one teardown sequence per endpoint lifetime.
/// `Launch` and `TransportConflict` are returned synchronously and do not
/// trigger teardown because nothing is open.
#[derive(Error, Debug)]
pub enum EndpointError {
    /// Peer closed the channel; handled silently.
    #[error("External socket closed")]
    TransportClosed,

    /// I/O error on the transport.
    #[error("transport I/O error: {0}")]
    TransportIo(String),

    /// Inbound frame failed validation.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A command payload could not be parsed.
    #[error("Invalid {0}")]
    UnparseablePayload(String),

    /// Send attempted with no available carrier.
    #[error("no connections")]
    NoSink,

    /// A transport is already live on this endpoint.
    #[error("transport already attached: {0}")]
    TransportConflict(&'static str),

    /// IPC launch failed; the endpoint stays stopped.
    #[error("launch failure ({stage}): {detail}")]
    Launch {
        stage: LaunchStage,
        detail: String,
    },

    /// Watchdog observed no PONG within the threshold.
    #[error("External worker unresponsive")]
    WorkerUnresponsive,

    /// Remote peer requested shutdown.
    #[error("Remote connection requesting shutdown: {0}")]
    RemoteShutdown(String),
}

impl EndpointError {
    /// Creates a launch failure.
    #[must_use]
    pub fn launch(stage: LaunchStage, detail: impl Into<String>) -> Self {
        Self::Launch {
            stage,
            detail: detail.into(),
        }
    }
}
