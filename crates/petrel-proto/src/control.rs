//! Control and message-bus payload messages.

use rkyv::{Archive, Deserialize, Serialize};

/// Message-bus severity flags carried by MESSAGE payloads.
///
/// These are bit flags; a message may carry more than one.
pub mod msgflags {
    /// Debug chatter, normally suppressed.
    pub const DEBUG: u32 = 1;
    /// Informational message.
    pub const INFO: u32 = 2;
    /// Error message.
    pub const ERROR: u32 = 4;
    /// Raise an alert.
    pub const ALERT: u32 = 8;
    /// Fatal condition.
    pub const FATAL: u32 = 16;
}

/// Text message forwarded to the daemon message bus.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MsgbusMessage {
    /// Message text.
    pub msgtext: String,
    /// Severity flags (see [`msgflags`]).
    pub msgtype: u32,
}

/// Health-check request. Carries no fields; the envelope seqno is echoed
/// back in the PONG.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping;

/// Health-check reply.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// Sequence number of the PING being answered.
    pub ping_seqno: u32,
}

/// Remote peer requests a shutdown of the channel.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExternalShutdown {
    /// Human-readable reason.
    pub reason: String,
}
