//! The external endpoint: connection lifecycle and protocol engine.
//!
//! One endpoint manages one peer — either an IPC child reached over a
//! pipe pair or a remote peer over TCP. It owns the inbound read loop,
//! the serialized write path with sequence assignment, the built-in
//! command handlers, and the teardown funnel. All mutable state sits
//! behind a single mutex which is never held across a blocking wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use petrel_proto::{
    commands, msgflags, Command, ExternalShutdown, FrameCodec, FrameHeader, MsgbusMessage, Pong,
    FRAME_HEADER_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ExternalConfig;
use crate::error::{EndpointError, LaunchStage};
use crate::http_bridge::{HttpProxySession, GATE_CANCELLED};
use crate::launcher;
use crate::traits::{
    Collaborators, CommandHook, EventBus, HttpServer, IpcCallback, IpcRecord, IpcTracker,
    MessageBus,
};
use crate::transport::{
    tcp_transport, TransportKind, TransportReader, TransportWriter, WriteCallback, WriteCompletion,
};
use crate::watchdog;

/// Callback invoked from `trigger_error` with the failure reason, before
/// teardown begins. Must not block.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked once when the endpoint closes.
pub type ClosureCallback = Box<dyn FnOnce() + Send>;

/// The stateful object managing one peer connection.
///
/// Cheap to clone; clones share the same endpoint.
#[derive(Clone)]
pub struct ExternalEndpoint {
    inner: Arc<EndpointInner>,
}

pub(crate) struct EndpointInner {
    pub(crate) config: ExternalConfig,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) tracker: Arc<dyn IpcTracker>,
    pub(crate) httpd: Arc<dyn HttpServer>,
    pub(crate) eventbus: Arc<dyn EventBus>,
    pub(crate) state: Mutex<EndpointState>,
}

pub(crate) struct EndpointState {
    /// No I/O should be initiated and inbound handlers early-return.
    pub(crate) stopped: bool,
    /// Teardown has been requested; further read completions close.
    pub(crate) cancelled: bool,
    /// Latch ensuring exactly one teardown sequence per lifetime.
    closed: bool,

    seqno: u32,
    pub(crate) last_pong: Option<Instant>,
    codec: FrameCodec,

    /// Aborts pending reads/writes and the watchdog; replaced on attach.
    cancel: CancellationToken,
    transport: Option<TransportKind>,
    ipc_pid: Option<i32>,
    child: Option<tokio::process::Child>,

    write_queue: Option<mpsc::UnboundedSender<Vec<u8>>>,
    write_cb: Option<WriteCallback>,
    closure_cb: Option<ClosureCallback>,
    error_cb: Option<ErrorCallback>,
    hook: Option<Arc<dyn CommandHook>>,

    external_binary: Option<String>,
    external_binary_args: Vec<String>,

    pub(crate) http_session_id: u32,
    pub(crate) http_sessions: HashMap<u32, Arc<HttpProxySession>>,
    pub(crate) eventbus_listeners: HashMap<String, u64>,
}

impl ExternalEndpoint {
    /// Creates an endpoint in the stopped state.
    #[must_use]
    pub fn new(config: ExternalConfig, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                config,
                bus: collaborators.bus,
                tracker: collaborators.tracker,
                httpd: collaborators.httpd,
                eventbus: collaborators.eventbus,
                state: Mutex::new(EndpointState {
                    stopped: true,
                    cancelled: true,
                    closed: false,
                    seqno: 0,
                    last_pong: None,
                    codec: FrameCodec::with_capacity(4096),
                    cancel: CancellationToken::new(),
                    transport: None,
                    ipc_pid: None,
                    child: None,
                    write_queue: None,
                    write_cb: None,
                    closure_cb: None,
                    error_cb: None,
                    hook: None,
                    external_binary: None,
                    external_binary_args: Vec::new(),
                    http_session_id: 0,
                    http_sessions: HashMap::new(),
                    eventbus_listeners: HashMap::new(),
                }),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &EndpointInner {
        &self.inner
    }

    /// Sets the helper binary and arguments for a later `run_ipc`.
    pub async fn set_binary(&self, binary: impl Into<String>, args: Vec<String>) {
        let mut st = self.inner.state.lock().await;
        st.external_binary = Some(binary.into());
        st.external_binary_args = args;
    }

    /// Installs the extension dispatch hook consulted for commands
    /// outside the built-in table.
    pub async fn set_command_hook(&self, hook: Arc<dyn CommandHook>) {
        self.inner.state.lock().await.hook = Some(hook);
    }

    /// Installs the error callback fired from `trigger_error`.
    pub async fn set_error_callback(&self, cb: ErrorCallback) {
        self.inner.state.lock().await.error_cb = Some(cb);
    }

    /// Installs a callback fired once when the endpoint closes.
    pub async fn set_closure_callback(&self, cb: ClosureCallback) {
        self.inner.state.lock().await.closure_cb = Some(cb);
    }

    /// Replaces outbound transports with a user write sink, used when the
    /// endpoint is hosted inside a larger connection multiplexer.
    pub async fn set_write_callback(&self, cb: WriteCallback) {
        self.inner.state.lock().await.write_cb = Some(cb);
    }

    /// Whether the endpoint is attached and serving traffic.
    pub async fn is_running(&self) -> bool {
        !self.inner.state.lock().await.stopped
    }

    /// Number of HTTP proxy sessions currently suspended.
    pub async fn active_http_sessions(&self) -> usize {
        self.inner.state.lock().await.http_sessions.len()
    }

    /// Number of event-bus listeners registered for this endpoint.
    pub async fn active_event_listeners(&self) -> usize {
        self.inner.state.lock().await.eventbus_listeners.len()
    }

    /// Time since the last PONG was observed, if any.
    pub async fn last_pong_elapsed(&self) -> Option<Duration> {
        self.inner
            .state
            .lock()
            .await
            .last_pong
            .map(|at| at.elapsed())
    }

    /// Attaches a connected TCP socket and starts the channel.
    ///
    /// Fails while an IPC child (or another TCP peer) is live; at most
    /// one transport may be attached at a time.
    pub async fn attach_tcp_socket(&self, socket: TcpStream) -> Result<(), EndpointError> {
        let mut st = self.inner.state.lock().await;

        st.stopped = true;

        if st.ipc_pid.is_some() {
            self.inner.bus.publish(
                "Tried to attach a TCP socket to an external endpoint that already has an \
                 IPC instance running",
                msgflags::ERROR,
            );
            return Err(EndpointError::TransportConflict(TransportKind::Ipc.name()));
        }

        if st.transport.is_some() {
            return Err(EndpointError::TransportConflict(TransportKind::Tcp.name()));
        }

        let (reader, writer) = tcp_transport(socket);
        self.start_channel(&mut st, TransportKind::Tcp, reader, writer);

        Ok(())
    }

    /// Locates, spawns, and attaches the configured helper binary.
    ///
    /// On failure the endpoint is left in the stopped state and nothing
    /// is open.
    pub async fn run_ipc(&self) -> Result<(), EndpointError> {
        let mut st = self.inner.state.lock().await;

        st.stopped = true;

        if st.transport.is_some() || st.ipc_pid.is_some() {
            return Err(EndpointError::TransportConflict(
                st.transport.map_or("ipc", TransportKind::name),
            ));
        }

        let Some(binary) = st.external_binary.clone() else {
            self.inner.bus.publish(
                "External interface did not have an IPC binary to launch",
                msgflags::ERROR,
            );
            return Err(EndpointError::launch(
                LaunchStage::MissingBinary,
                "no helper binary configured",
            ));
        };
        let args = st.external_binary_args.clone();

        let worker = match launcher::launch_worker(&self.inner.config, &binary, &args) {
            Ok(worker) => worker,
            Err(e) => {
                self.inner.bus.publish(&e.to_string(), msgflags::ERROR);
                return Err(e);
            }
        };

        let on_close = self.spawning_callback(|endpoint, _reason| async move {
            endpoint.close_external().await;
        });
        let on_error = self.spawning_callback(|endpoint, reason| async move {
            endpoint.trigger_error(&reason).await;
        });
        self.inner.tracker.register(IpcRecord {
            pid: worker.pid,
            on_close,
            on_error,
        });

        st.ipc_pid = Some(worker.pid);
        st.child = Some(worker.child);
        self.start_channel(&mut st, TransportKind::Ipc, worker.reader, worker.writer);

        Ok(())
    }

    /// Builds an `IpcCallback` that hops onto the runtime before running
    /// an async action against this endpoint.
    fn spawning_callback<F, Fut>(&self, action: F) -> IpcCallback
    where
        F: Fn(ExternalEndpoint, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let endpoint = self.clone();
        Arc::new(move |reason: String| {
            let fut = action(endpoint.clone(), reason);
            tokio::spawn(fut);
        })
    }

    /// Wires up the writer, reader, and watchdog tasks and flips the
    /// lifecycle flags. Caller holds the state lock.
    fn start_channel(
        &self,
        st: &mut EndpointState,
        kind: TransportKind,
        reader: TransportReader,
        writer: TransportWriter,
    ) {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        st.cancel = cancel.clone();
        st.write_queue = Some(tx);
        st.transport = Some(kind);
        st.stopped = false;
        st.cancelled = false;
        st.closed = false;
        st.last_pong = Some(Instant::now());

        tokio::spawn(write_loop(self.clone(), writer, rx, cancel.clone()));
        tokio::spawn(read_loop(self.clone(), reader, cancel.clone()));
        tokio::spawn(watchdog::run(
            self.clone(),
            self.inner.config.ping_interval,
            self.inner.config.pong_timeout(),
            cancel,
        ));
    }

    /// Sends a command, assigning the next sequence number when unset.
    ///
    /// Returns the assigned seqno, or 0 when no carrier is available (the
    /// error funnel fires in that case). Frames are posted whole, in
    /// invocation order, to the first available sink: the user write
    /// callback, else the live transport's write queue.
    pub async fn send_command(&self, mut command: Command) -> u32 {
        enum Sink {
            Callback(WriteCallback),
            Queue(mpsc::UnboundedSender<Vec<u8>>),
        }

        let (frame, seqno, sink) = {
            let mut st = self.inner.state.lock().await;

            if command.seqno == 0 {
                st.seqno = next_seqno(st.seqno);
                command.seqno = st.seqno;
            }

            let frame = match st.codec.encode(&command) {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => {
                    drop(st);
                    error!(error = %e, command = %command.command, "Failed to encode outbound frame");
                    self.trigger_error(&format!("encode failure: {e}")).await;
                    return 0;
                }
            };

            let sink = if let Some(cb) = &st.write_cb {
                Some(Sink::Callback(cb.clone()))
            } else {
                st.write_queue.clone().map(Sink::Queue)
            };

            (frame, command.seqno, sink)
        };

        match sink {
            None => {
                self.inner.bus.publish(
                    "External interface got an error writing packet, no connections",
                    msgflags::ERROR,
                );
                self.trigger_error(&EndpointError::NoSink.to_string()).await;
                0
            }
            Some(Sink::Callback(cb)) => {
                let endpoint = self.clone();
                let completion: WriteCompletion = Box::new(move |result| {
                    if result.is_err() {
                        // Idempotent funnel; a completion racing teardown
                        // is a no-op.
                        tokio::spawn(async move {
                            endpoint.trigger_error("write failure").await;
                        });
                    }
                });
                cb(frame, completion);
                seqno
            }
            Some(Sink::Queue(queue)) => {
                if queue.send(frame).is_err() {
                    self.trigger_error("write failure").await;
                    return 0;
                }
                seqno
            }
        }
    }

    /// Sends a PING with an auto-assigned seqno.
    pub async fn send_ping(&self) -> u32 {
        match Command::ping() {
            Ok(c) => self.send_command(c).await,
            Err(e) => {
                error!(error = %e, "Failed to build PING");
                0
            }
        }
    }

    /// Sends a PONG echoing the PING's seqno.
    pub async fn send_pong(&self, ping_seqno: u32) -> u32 {
        match Command::pong(ping_seqno) {
            Ok(c) => self.send_command(c).await,
            Err(e) => {
                error!(error = %e, "Failed to build PONG");
                0
            }
        }
    }

    /// Asks the peer to shut down.
    pub async fn send_shutdown(&self, reason: impl Into<String>) -> u32 {
        match Command::shutdown(reason) {
            Ok(c) => self.send_command(c).await,
            Err(e) => {
                error!(error = %e, "Failed to build SHUTDOWN");
                0
            }
        }
    }

    /// The error funnel: every runtime failure leads here.
    ///
    /// Idempotent; the first caller claims the teardown, invokes the
    /// user error callback, and closes the endpoint.
    pub async fn trigger_error(&self, msg: &str) {
        let error_cb = {
            let mut st = self.inner.state.lock().await;
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.error_cb.clone()
        };

        if let Some(cb) = error_cb {
            cb(msg);
        }

        self.close_external().await;
    }

    /// Tears down the endpoint: removes event-bus listeners, fails live
    /// HTTP sessions, stops the watchdog, hard-kills the IPC child,
    /// closes the transport, and drops the write and closure callbacks.
    ///
    /// Safe to call repeatedly; only the first call does work.
    pub async fn close_external(&self) {
        let closure_cb = {
            let mut st = self.inner.state.lock().await;

            st.stopped = true;
            st.cancelled = true;

            if st.closed {
                return;
            }
            st.closed = true;

            for (_, listener_id) in st.eventbus_listeners.drain() {
                self.inner.eventbus.remove_listener(listener_id);
            }

            // Fail suspended requests; each handler removes its own map
            // entry once released.
            for session in st.http_sessions.values() {
                session.connection.cancel();
                session.gate.unlatch(GATE_CANCELLED);
            }

            // Stops the watchdog and aborts pending reads/writes; the
            // tasks drop the transport halves on exit.
            st.cancel.cancel();

            if let Some(pid) = st.ipc_pid.take() {
                self.inner.tracker.remove(pid);
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
            st.child = None;

            st.transport = None;
            st.write_queue = None;
            st.write_cb = None;
            st.closure_cb.take()
        };

        if let Some(cb) = closure_cb {
            cb();
        }
    }

    /// Closes the pipe ends and delivers SIGTERM to the IPC child.
    ///
    /// Advisory; callers wanting a grace period should soft-kill, wait,
    /// then hard-kill.
    pub async fn ipc_soft_kill(&self) {
        self.ipc_kill(nix::sys::signal::Signal::SIGTERM).await;
    }

    /// Closes the pipe ends and delivers SIGKILL to the IPC child.
    pub async fn ipc_hard_kill(&self) {
        self.ipc_kill(nix::sys::signal::Signal::SIGKILL).await;
    }

    async fn ipc_kill(&self, signal: nix::sys::signal::Signal) {
        let mut st = self.inner.state.lock().await;

        st.stopped = true;
        st.cancelled = true;
        st.cancel.cancel();

        if let Some(pid) = st.ipc_pid.take() {
            self.inner.tracker.remove(pid);
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal);
        }
        st.child = None;

        if st.transport == Some(TransportKind::Ipc) {
            st.transport = None;
            st.write_queue = None;
        }
    }

    /// Routes a decoded command to its handler.
    ///
    /// Built-in commands first, then the extension hook; anything left is
    /// dropped for forward compatibility with newer workers.
    pub(crate) async fn dispatch_rx(&self, command: Command) {
        match command.command.as_str() {
            commands::MESSAGE => self.handle_message(&command.content).await,
            commands::PING => self.handle_ping(command.seqno).await,
            commands::PONG => self.handle_pong(&command.content).await,
            commands::SHUTDOWN => self.handle_shutdown(&command.content).await,
            commands::HTTP_REGISTER_URI => self.handle_http_register(&command.content).await,
            commands::HTTP_RESPONSE => self.handle_http_response(&command.content).await,
            commands::HTTP_AUTH_REQ => self.handle_http_auth_request(&command.content).await,
            commands::EVENTBUS_REGISTER => self.handle_eventbus_register(&command.content).await,
            commands::EVENTBUS_PUBLISH => self.handle_eventbus_publish(&command.content).await,
            _ => {
                let hook = self.inner.state.lock().await.hook.clone();
                if let Some(hook) = hook {
                    if hook.dispatch(&command).await {
                        return;
                    }
                }
                debug!(command = %command.command, "Dropping unknown command");
            }
        }
    }

    async fn handle_message(&self, content: &[u8]) {
        let msg: MsgbusMessage = match petrel_proto::codec::decode_payload(content) {
            Ok(m) => m,
            Err(_) => {
                self.inner.bus.publish(
                    "External interface got an unparsable MESSAGE",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload(commands::MESSAGE.to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        self.handle_msg_proxy(&msg.msgtext, msg.msgtype);
    }

    /// Forwards a worker message to the daemon message bus.
    fn handle_msg_proxy(&self, text: &str, flags: u32) {
        self.inner.bus.publish(text, flags);
    }

    async fn handle_ping(&self, seqno: u32) {
        self.send_pong(seqno).await;
    }

    async fn handle_pong(&self, content: &[u8]) {
        let _pong: Pong = match petrel_proto::codec::decode_payload(content) {
            Ok(p) => p,
            Err(_) => {
                self.inner.bus.publish(
                    "External interface got an unparsable PONG packet",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload(commands::PONG.to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        self.inner.state.lock().await.last_pong = Some(Instant::now());
    }

    async fn handle_shutdown(&self, content: &[u8]) {
        let shutdown: ExternalShutdown = match petrel_proto::codec::decode_payload(content) {
            Ok(s) => s,
            Err(_) => {
                self.inner.bus.publish(
                    "External interface got an unparsable SHUTDOWN",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload(commands::SHUTDOWN.to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        self.inner.bus.publish(
            &format!("External interface shutting down: {}", shutdown.reason),
            msgflags::INFO,
        );
        self.trigger_error(&EndpointError::RemoteShutdown(shutdown.reason).to_string())
            .await;
    }

    async fn handle_read_error(&self, e: std::io::Error) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            // Be quiet about EOF.
            self.trigger_error(&EndpointError::TransportClosed.to_string())
                .await;
        } else {
            error!(error = %e, "External API handler got error reading data");
            self.trigger_error(&EndpointError::TransportIo(e.to_string()).to_string())
                .await;
        }
    }
}

/// Advances the sequence counter; zero is reserved for "unset", so the
/// wrap from `u32::MAX` lands on 1.
const fn next_seqno(seqno: u32) -> u32 {
    if seqno == u32::MAX {
        1
    } else {
        seqno + 1
    }
}

/// Drains the write queue into the transport's write half.
///
/// Frames arrive whole from `send_command`; any write error other than
/// cancellation funnels.
async fn write_loop(
    endpoint: ExternalEndpoint,
    mut writer: TransportWriter,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            if cancel.is_cancelled() {
                return;
            }
            error!(error = %e, "External interface got an error writing a packet");
            endpoint.trigger_error("write failure").await;
            return;
        }
    }
}

/// Reads frames continuously: header, validation, payload, decode,
/// dispatch. Exits silently on cancellation, quietly funnels on EOF, and
/// logs + funnels everything else.
async fn read_loop(
    endpoint: ExternalEndpoint,
    mut reader: TransportReader,
    cancel: CancellationToken,
) {
    loop {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            r = reader.read_exact(&mut header_buf) => r,
        };
        if let Err(e) = read {
            endpoint.handle_read_error(e).await;
            return;
        }

        {
            let st = endpoint.inner.state.lock().await;
            if st.stopped {
                return;
            }
            if st.cancelled {
                drop(st);
                endpoint.close_external().await;
                return;
            }
        }

        let header = match FrameHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "External interface got an invalid frame header");
                endpoint
                    .trigger_error(&EndpointError::InvalidFrame(e.to_string()).to_string())
                    .await;
                return;
            }
        };

        #[allow(clippy::as_conversions)]
        let data_sz = header.data_sz as usize;
        if header.validate_data_sz().is_err() || data_sz > endpoint.inner.config.max_frame_size {
            error!(data_sz, "External interface got an oversized frame");
            endpoint
                .trigger_error(
                    &EndpointError::InvalidFrame(format!("oversized frame: {data_sz} bytes"))
                        .to_string(),
                )
                .await;
            return;
        }

        let mut data = vec![0u8; data_sz];
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            r = reader.read_exact(&mut data) => r,
        };
        if let Err(e) = read {
            endpoint.handle_read_error(e).await;
            return;
        }

        let command = match FrameCodec::decode_command(&header, &data) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "External interface got an undecodable frame");
                endpoint
                    .trigger_error(&EndpointError::InvalidFrame(e.to_string()).to_string())
                    .await;
                return;
            }
        };

        endpoint.dispatch_rx(command).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_increments_and_wraps_past_zero() {
        assert_eq!(next_seqno(0), 1);
        assert_eq!(next_seqno(1), 2);
        assert_eq!(next_seqno(u32::MAX - 1), u32::MAX);
        assert_eq!(next_seqno(u32::MAX), 1);
    }
}
