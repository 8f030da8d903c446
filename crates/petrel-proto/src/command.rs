//! Command envelope carried by every frame.

use rkyv::{Archive, Deserialize, Serialize};

use crate::codec::encode_payload;
use crate::control::{ExternalShutdown, Ping, Pong};
use crate::error::ProtocolError;
use crate::eventbus::EventbusEvent;
use crate::http::{HttpAuthToken, HttpRequest, HttpVariable};

/// Built-in command names.
pub mod commands {
    /// Text message for the daemon message bus.
    pub const MESSAGE: &str = "MESSAGE";
    /// Health-check request.
    pub const PING: &str = "PING";
    /// Health-check reply.
    pub const PONG: &str = "PONG";
    /// Remote peer requests shutdown.
    pub const SHUTDOWN: &str = "SHUTDOWN";
    /// Worker registers a proxied HTTP route.
    pub const HTTP_REGISTER_URI: &str = "HTTPREGISTERURI";
    /// Daemon forwards an HTTP request to the worker.
    pub const HTTP_REQUEST: &str = "HTTPREQUEST";
    /// Worker completes a proxied HTTP request.
    pub const HTTP_RESPONSE: &str = "HTTPRESPONSE";
    /// Worker requests an auth token.
    pub const HTTP_AUTH_REQ: &str = "HTTPAUTHREQ";
    /// Daemon replies with a minted auth token.
    pub const HTTP_AUTH: &str = "HTTPAUTH";
    /// Worker subscribes to named events.
    pub const EVENTBUS_REGISTER: &str = "EVENTBUSREGISTER";
    /// Worker publishes an event onto the daemon bus.
    pub const EVENTBUS_PUBLISH: &str = "EVENTBUSPUBLISH";
    /// Daemon forwards a subscribed event to the worker.
    pub const EVENT: &str = "EVENT";
}

/// A named, sequenced message with an opaque serialized payload.
///
/// Sequence numbers are assigned by the sender; zero means "unset" and is
/// replaced at send time. Replies echo the originating seqno in their
/// payload (e.g. PONG carries the PING's seqno).
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name, matched against the dispatch table.
    pub command: String,

    /// Sender-assigned sequence number; zero is reserved for "unset".
    pub seqno: u32,

    /// Serialized sub-message whose schema depends on `command`.
    pub content: Vec<u8>,
}

impl Command {
    /// Creates a command with an unset sequence number.
    #[must_use]
    pub fn new(command: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            seqno: 0,
            content,
        }
    }

    /// Creates a PING command.
    pub fn ping() -> Result<Self, ProtocolError> {
        Ok(Self::new(commands::PING, encode_payload(&Ping)?))
    }

    /// Creates a PONG reply echoing the PING's sequence number.
    pub fn pong(ping_seqno: u32) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            commands::PONG,
            encode_payload(&Pong { ping_seqno })?,
        ))
    }

    /// Creates a SHUTDOWN command.
    pub fn shutdown(reason: impl Into<String>) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            commands::SHUTDOWN,
            encode_payload(&ExternalShutdown {
                reason: reason.into(),
            })?,
        ))
    }

    /// Creates an HTTPREQUEST command forwarding a proxied request.
    pub fn http_request(
        req_id: u32,
        uri: impl Into<String>,
        method: impl Into<String>,
        variable_data: Vec<HttpVariable>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            commands::HTTP_REQUEST,
            encode_payload(&HttpRequest {
                req_id,
                uri: uri.into(),
                method: method.into(),
                variable_data,
            })?,
        ))
    }

    /// Creates an HTTPAUTH reply carrying a minted token.
    pub fn http_auth(token: impl Into<String>) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            commands::HTTP_AUTH,
            encode_payload(&HttpAuthToken {
                token: token.into(),
            })?,
        ))
    }

    /// Creates an EVENT command carrying a serialized event.
    pub fn event(event_json: impl Into<String>) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            commands::EVENT,
            encode_payload(&EventbusEvent {
                event_json: event_json.into(),
            })?,
        ))
    }
}
