//! Shared mock collaborators and a wire-speaking test peer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use petrel_external::{
    BusEvent, Collaborators, EventBus, EventListener, ExternalConfig, ExternalEndpoint,
    HttpConnection, HttpServer, IpcRecord, IpcTracker, MessageBus, Role, RouteHandler,
};
use petrel_proto::{Command, FrameCodec, FrameHeader, FRAME_HEADER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Records every message published to the daemon bus.
#[derive(Default)]
pub struct MockBus {
    pub messages: Mutex<Vec<(String, u32)>>,
}

impl MockBus {
    pub fn contains(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|(text, _)| text.contains(needle))
    }
}

impl MessageBus for MockBus {
    fn publish(&self, text: &str, flags: u32) {
        self.messages.lock().unwrap().push((text.to_owned(), flags));
    }
}

/// Records IPC registrations and removals.
#[derive(Default)]
pub struct MockTracker {
    pub registered: Mutex<Vec<i32>>,
    pub removed: Mutex<Vec<i32>>,
}

impl IpcTracker for MockTracker {
    fn register(&self, record: IpcRecord) {
        self.registered.lock().unwrap().push(record.pid);
    }

    fn remove(&self, pid: i32) {
        self.removed.lock().unwrap().push(pid);
    }
}

pub struct RegisteredRoute {
    pub uri: String,
    pub method: String,
    pub role: Role,
    pub handler: RouteHandler,
}

/// Records registered routes and minted tokens.
#[derive(Default)]
pub struct MockHttpd {
    pub routes: Mutex<Vec<RegisteredRoute>>,
    pub tokens: Mutex<Vec<(String, Role)>>,
}

impl MockHttpd {
    pub fn route(&self, uri: &str) -> Option<RouteHandler> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.uri == uri)
            .map(|r| r.handler.clone())
    }
}

impl HttpServer for MockHttpd {
    fn register_route(&self, uri: &str, method: &str, role: Role, handler: RouteHandler) {
        self.routes.lock().unwrap().push(RegisteredRoute {
            uri: uri.to_owned(),
            method: method.to_owned(),
            role,
            handler,
        });
    }

    fn create_auth(&self, name: &str, role: Role, _ttl_secs: u64) -> String {
        let token = format!("token-{name}");
        self.tokens.lock().unwrap().push((token.clone(), role));
        token
    }
}

/// One fake in-flight HTTP request.
pub struct MockConnection {
    pub req_uri: String,
    pub req_method: String,
    pub variables: HashMap<String, String>,
    pub headers: Mutex<Vec<(String, String)>>,
    pub status: Mutex<Option<u16>>,
    pub body: Mutex<Vec<u8>>,
    pub body_seen_before_headers: AtomicBool,
    pub completed: AtomicBool,
    pub cancelled: AtomicBool,
    closure: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MockConnection {
    pub fn new(uri: &str, method: &str, variables: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            req_uri: uri.to_owned(),
            req_method: method.to_owned(),
            variables: variables
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            headers: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            body: Mutex::new(Vec::new()),
            body_seen_before_headers: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            closure: Mutex::new(None),
        })
    }

    /// Simulates the client dropping the connection.
    pub fn disconnect(&self) {
        if let Some(cb) = self.closure.lock().unwrap().take() {
            cb();
        }
    }
}

impl HttpConnection for MockConnection {
    fn uri(&self) -> String {
        self.req_uri.clone()
    }

    fn method(&self) -> String {
        self.req_method.clone()
    }

    fn http_variables(&self) -> HashMap<String, String> {
        self.variables.clone()
    }

    fn append_header(
        &self,
        name: &str,
        value: &str,
    ) -> Result<(), petrel_external::ConnectionError> {
        if !self.body.lock().unwrap().is_empty() {
            self.body_seen_before_headers.store(true, Ordering::SeqCst);
            return Err(petrel_external::ConnectionError(
                "headers after body".to_owned(),
            ));
        }
        self.headers
            .lock()
            .unwrap()
            .push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    fn set_status(&self, code: u16) -> Result<(), petrel_external::ConnectionError> {
        *self.status.lock().unwrap() = Some(code);
        Ok(())
    }

    fn put_data(&self, data: &[u8]) {
        self.body.lock().unwrap().extend_from_slice(data);
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn set_closure_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.closure.lock().unwrap() = Some(cb);
    }
}

/// In-memory event bus tracking listener registrations.
#[derive(Default)]
pub struct MockEventBus {
    next_id: AtomicU64,
    pub listeners: Mutex<HashMap<u64, (String, EventListener)>>,
    pub removed: Mutex<Vec<u64>>,
    pub published: Mutex<Vec<BusEvent>>,
}

impl MockEventBus {
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Delivers an event to every listener registered for its type.
    pub fn emit(&self, event: &BusEvent) {
        let listeners: Vec<EventListener> = self
            .listeners
            .lock()
            .unwrap()
            .values()
            .filter(|(name, _)| *name == event.event_type)
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

impl EventBus for MockEventBus {
    fn register_listener(&self, event: &str, listener: EventListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners
            .lock()
            .unwrap()
            .insert(id, (event.to_owned(), listener));
        id
    }

    fn remove_listener(&self, id: u64) {
        self.listeners.lock().unwrap().remove(&id);
        self.removed.lock().unwrap().push(id);
    }

    fn event(&self, event_type: &str) -> BusEvent {
        BusEvent::new(event_type)
    }

    fn publish(&self, event: BusEvent) {
        self.published.lock().unwrap().push(event);
    }
}

/// The full mock collaborator set.
pub struct Mocks {
    pub bus: Arc<MockBus>,
    pub tracker: Arc<MockTracker>,
    pub httpd: Arc<MockHttpd>,
    pub eventbus: Arc<MockEventBus>,
}

pub fn mocks() -> (Collaborators, Mocks) {
    let bus = Arc::new(MockBus::default());
    let tracker = Arc::new(MockTracker::default());
    let httpd = Arc::new(MockHttpd::default());
    let eventbus = Arc::new(MockEventBus::default());

    let collaborators = Collaborators {
        bus: bus.clone(),
        tracker: tracker.clone(),
        httpd: httpd.clone(),
        eventbus: eventbus.clone(),
    };

    (
        collaborators,
        Mocks {
            bus,
            tracker,
            httpd,
            eventbus,
        },
    )
}

/// Records reasons passed to the endpoint error callback.
#[derive(Default)]
pub struct ErrorProbe {
    pub reasons: Mutex<Vec<String>>,
}

impl ErrorProbe {
    pub async fn install(self: &Arc<Self>, endpoint: &ExternalEndpoint) {
        let probe = self.clone();
        endpoint
            .set_error_callback(Arc::new(move |reason| {
                probe.reasons.lock().unwrap().push(reason.to_owned());
            }))
            .await;
    }

    pub fn fired(&self) -> bool {
        !self.reasons.lock().unwrap().is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.reasons
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.contains(needle))
    }
}

/// The remote half of the channel, speaking raw frames over TCP.
pub struct TestPeer {
    stream: TcpStream,
    codec: FrameCodec,
}

impl TestPeer {
    /// Connects an endpoint and a peer over a localhost socket pair.
    pub async fn attach(endpoint: &ExternalEndpoint) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (accepted, connected) =
            tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (server_stream, _) = accepted.unwrap();

        endpoint.attach_tcp_socket(server_stream).await.unwrap();

        Self {
            stream: connected.unwrap(),
            codec: FrameCodec::new(),
        }
    }

    pub async fn send(&mut self, command: &Command) {
        let frame = self.codec.encode(command).unwrap().to_vec();
        self.stream.write_all(&frame).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Receives the next frame, failing the test after five seconds.
    pub async fn recv(&mut self) -> Command {
        tokio::time::timeout(Duration::from_secs(5), self.recv_inner())
            .await
            .expect("timed out waiting for a frame from the endpoint")
    }

    async fn recv_inner(&mut self) -> Command {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        self.stream.read_exact(&mut header_buf).await.unwrap();
        let header = FrameHeader::decode(&header_buf).unwrap();

        let mut data = vec![0u8; header.data_sz as usize];
        self.stream.read_exact(&mut data).await.unwrap();

        FrameCodec::decode_command(&header, &data).unwrap()
    }

    /// Receives frames until one matches the given command name.
    pub async fn recv_named(&mut self, name: &str) -> Command {
        loop {
            let command = self.recv().await;
            if command.command == name {
                return command;
            }
        }
    }

    /// True once the endpoint side has closed the socket.
    pub async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await,
            Ok(Ok(0))
        )
    }
}

/// Polls a condition until it holds or five seconds pass.
pub async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within five seconds"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An endpoint wired to mocks with an error probe installed.
pub async fn endpoint_with_mocks(
    config: ExternalConfig,
) -> (ExternalEndpoint, Mocks, Arc<ErrorProbe>) {
    let (collaborators, mocks) = mocks();
    let endpoint = ExternalEndpoint::new(config, collaborators);
    let probe = Arc::new(ErrorProbe::default());
    probe.install(&endpoint).await;
    (endpoint, mocks, probe)
}
