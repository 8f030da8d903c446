//! Wire protocol for the Petrel external helper channel.
//!
//! The helper channel is a bidirectional, length-framed, checksummed
//! command stream between the daemon and an external worker. This crate
//! provides the frame codec and the typed command payloads; the endpoint
//! engine lives in `petrel-external`.
//!
//! # Wire Format
//!
//! Every frame carries one serialized [`Command`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Frame Header (12 bytes, fixed)              │
//! ├──────────────┬────────────────┬──────────────────────────┤
//! │ Signature (4)│ Adler-32  (4)  │    Payload Length (4)    │
//! ├──────────────┴────────────────┴──────────────────────────┤
//! │                 rkyv-serialised Command                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All header fields are big-endian. The checksum is Adler-32 over the
//! payload bytes exactly. `Command.content` is itself a serialized
//! sub-message whose schema depends on the command name.

pub mod codec;
mod command;
mod control;
mod error;
mod eventbus;
mod http;

pub use codec::{
    checksum, FrameCodec, FrameHeader, FRAME_HEADER_SIZE, FRAME_SIGNATURE, MAX_DATA_SIZE,
};
pub use command::{commands, Command};
pub use control::{msgflags, ExternalShutdown, MsgbusMessage, Ping, Pong};
pub use error::ProtocolError;
pub use eventbus::{EventbusEvent, EventbusPublishEvent, EventbusRegisterListener};
pub use http::{
    HttpAuthToken, HttpAuthTokenRequest, HttpHeader, HttpRegisterUri, HttpRequest, HttpResponse,
    HttpVariable,
};
