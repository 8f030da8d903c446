//! Transport carriers for the helper channel.
//!
//! Two carriers exist: a pipe pair to a spawned child (two half-duplex
//! descriptors) and a TCP socket. Both are reduced to boxed async
//! read/write halves; cancellation is driven by the endpoint's
//! `CancellationToken` and close is a drop of the halves.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio::net::TcpStream;

/// Read half of a transport.
pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport.
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Completion callback for a user write sink.
pub type WriteCompletion = Box<dyn FnOnce(std::io::Result<()>) + Send>;

/// User-provided write sink replacing both transports for outbound
/// traffic, used when the endpoint is hosted inside a larger connection
/// multiplexer. Inbound still requires a transport.
pub type WriteCallback = Arc<dyn Fn(Vec<u8>, WriteCompletion) + Send + Sync>;

/// Which carrier is currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Pipe pair to an IPC child.
    Ipc,
    /// TCP socket to a remote peer.
    Tcp,
}

impl TransportKind {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Tcp => "tcp",
        }
    }
}

/// Wraps the parent's pipe ends as transport halves.
///
/// `read_fd` is the read end of the child→parent pipe, `write_fd` the
/// write end of the parent→child pipe.
pub fn pipe_transport(
    read_fd: OwnedFd,
    write_fd: OwnedFd,
) -> std::io::Result<(TransportReader, TransportWriter)> {
    let reader = pipe::Receiver::from_owned_fd(read_fd)?;
    let writer = pipe::Sender::from_owned_fd(write_fd)?;
    Ok((Box::new(reader), Box::new(writer)))
}

/// Splits a TCP socket into transport halves.
#[must_use]
pub fn tcp_transport(stream: TcpStream) -> (TransportReader, TransportWriter) {
    let (read_half, write_half) = stream.into_split();
    (Box::new(read_half), Box::new(write_half))
}
