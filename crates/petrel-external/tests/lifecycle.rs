//! Lifecycle, watchdog, IPC, and event-bridge integration tests.

mod common;

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use common::{endpoint_with_mocks, wait_for, TestPeer};
use petrel_external::{BusEvent, EndpointError, ExternalConfig, EVENT_JSON_FIELD};
use petrel_proto::codec::{decode_payload, encode_payload};
use petrel_proto::{
    commands, Command, EventbusEvent, EventbusPublishEvent, EventbusRegisterListener,
};

fn quiet_config() -> ExternalConfig {
    ExternalConfig {
        ping_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// Config with a fast watchdog for unresponsiveness tests.
fn impatient_config() -> ExternalConfig {
    ExternalConfig {
        ping_interval: Duration::from_millis(50),
        pong_timeout_factor: 3,
        ..Default::default()
    }
}

/// Drops a helper script on disk that ignores its fd arguments and
/// sleeps, standing in for a real worker binary.
fn helper_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("petrel_helper");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\nexec sleep 30").unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

fn ipc_config(dir: &tempfile::TempDir) -> ExternalConfig {
    ExternalConfig {
        helper_binary_path: vec![dir.path().to_string_lossy().into_owned()],
        ping_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

#[tokio::test]
async fn unresponsive_worker_trips_the_watchdog() {
    let (endpoint, _mocks, probe) = endpoint_with_mocks(impatient_config()).await;
    let mut peer = TestPeer::attach(&endpoint).await;

    // Swallow PINGs without answering.
    let pings = tokio::spawn(async move {
        let mut count = 0u32;
        while peer.recv_named(commands::PING).await.seqno > 0 {
            count += 1;
            if count > 64 {
                break;
            }
        }
    });

    wait_for(|| probe.fired()).await;
    assert!(probe.contains("External worker unresponsive"));
    assert!(!endpoint.is_running().await);
    pings.abort();
}

#[tokio::test]
async fn unresponsive_ipc_child_is_killed() {
    let dir = helper_dir();
    let config = ExternalConfig {
        helper_binary_path: vec![dir.path().to_string_lossy().into_owned()],
        ping_interval: Duration::from_millis(50),
        pong_timeout_factor: 3,
        ..Default::default()
    };
    let (endpoint, mocks, probe) = endpoint_with_mocks(config).await;
    endpoint.set_binary("petrel_helper", Vec::new()).await;
    endpoint.run_ipc().await.unwrap();

    let pid = mocks.tracker.registered.lock().unwrap()[0];

    // The helper never answers PINGs, so the watchdog must tear the
    // channel down and the child must be removed from the tracker.
    wait_for(|| probe.fired()).await;
    assert!(probe.contains("External worker unresponsive"));
    wait_for(|| mocks.tracker.removed.lock().unwrap().contains(&pid)).await;
    assert!(!endpoint.is_running().await);
}

#[tokio::test]
async fn responsive_worker_keeps_the_watchdog_quiet() {
    // Pings arrive every 50 ms but the staleness window is a full
    // second, so answered pings must never trip the funnel here.
    let config = ExternalConfig {
        ping_interval: Duration::from_millis(50),
        pong_timeout_factor: 20,
        ..Default::default()
    };
    let (endpoint, _mocks, probe) = endpoint_with_mocks(config).await;
    let mut peer = TestPeer::attach(&endpoint).await;

    // Answer every PING for over a full timeout window.
    let answering = tokio::spawn(async move {
        loop {
            let ping = peer.recv_named(commands::PING).await;
            peer.send(&Command::pong(ping.seqno).unwrap()).await;
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(endpoint.is_running().await);
    assert!(!probe.fired());
    answering.abort();
}

#[tokio::test]
async fn eventbus_register_and_cleanup_on_close() {
    let (endpoint, mocks, _probe) = endpoint_with_mocks(quiet_config()).await;
    let mut peer = TestPeer::attach(&endpoint).await;

    let payload = encode_payload(&EventbusRegisterListener {
        event: vec!["GPS_LOCATION".to_owned(), "TIMESTAMP".to_owned()],
    })
    .unwrap();
    peer.send(&Command::new(commands::EVENTBUS_REGISTER, payload))
        .await;

    wait_for(|| mocks.eventbus.listener_count() == 2).await;
    assert_eq!(endpoint.active_event_listeners().await, 2);

    // A broker-side event must be proxied over the channel as EVENT.
    let mut event = BusEvent::new("GPS_LOCATION");
    event
        .content
        .insert("lat".to_owned(), serde_json::json!(51.5074));
    mocks.eventbus.emit(&event);

    let forwarded = peer.recv_named(commands::EVENT).await;
    let payload: EventbusEvent = decode_payload(&forwarded.content).unwrap();
    assert!(payload.event_json.contains("GPS_LOCATION"));
    assert!(payload.event_json.contains("51.5074"));

    endpoint.close_external().await;
    assert_eq!(mocks.eventbus.listener_count(), 0);
    assert_eq!(endpoint.active_event_listeners().await, 0);
}

#[tokio::test]
async fn repeated_registration_replaces_prior_listener() {
    let (endpoint, mocks, _probe) = endpoint_with_mocks(quiet_config()).await;
    let mut peer = TestPeer::attach(&endpoint).await;

    for _ in 0..2 {
        let payload = encode_payload(&EventbusRegisterListener {
            event: vec!["GPS_LOCATION".to_owned()],
        })
        .unwrap();
        peer.send(&Command::new(commands::EVENTBUS_REGISTER, payload))
            .await;
    }

    wait_for(|| !mocks.eventbus.removed.lock().unwrap().is_empty()).await;
    assert_eq!(mocks.eventbus.listener_count(), 1);
    assert_eq!(endpoint.active_event_listeners().await, 1);
}

#[tokio::test]
async fn worker_published_event_lands_on_the_bus() {
    let (endpoint, mocks, _probe) = endpoint_with_mocks(quiet_config()).await;
    let mut peer = TestPeer::attach(&endpoint).await;

    let payload = encode_payload(&EventbusPublishEvent {
        event_type: "WORKER_STATE".to_owned(),
        event_content_json: r#"{"state":"running"}"#.to_owned(),
    })
    .unwrap();
    peer.send(&Command::new(commands::EVENTBUS_PUBLISH, payload))
        .await;

    wait_for(|| !mocks.eventbus.published.lock().unwrap().is_empty()).await;

    let published = mocks.eventbus.published.lock().unwrap();
    assert_eq!(published[0].event_type, "WORKER_STATE");
    assert_eq!(
        published[0].content.get(EVENT_JSON_FIELD),
        Some(&serde_json::Value::String(
            r#"{"state":"running"}"#.to_owned()
        ))
    );
    drop(published);
    assert!(endpoint.is_running().await);
}

#[tokio::test]
async fn run_ipc_registers_and_close_kills() {
    let dir = helper_dir();
    let (endpoint, mocks, _probe) = endpoint_with_mocks(ipc_config(&dir)).await;
    endpoint.set_binary("petrel_helper", Vec::new()).await;

    endpoint.run_ipc().await.unwrap();
    assert!(endpoint.is_running().await);

    let pid = {
        let registered = mocks.tracker.registered.lock().unwrap();
        assert_eq!(registered.len(), 1);
        registered[0]
    };
    assert!(pid > 0);

    endpoint.close_external().await;
    assert!(!endpoint.is_running().await);
    assert_eq!(*mocks.tracker.removed.lock().unwrap(), vec![pid]);
}

#[tokio::test]
async fn attach_tcp_fails_while_ipc_is_live() {
    let dir = helper_dir();
    let (endpoint, mocks, _probe) = endpoint_with_mocks(ipc_config(&dir)).await;
    endpoint.set_binary("petrel_helper", Vec::new()).await;
    endpoint.run_ipc().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, _connected) = tokio::join!(
        listener.accept(),
        tokio::net::TcpStream::connect(addr)
    );
    let (stream, _) = accepted.unwrap();

    let err = endpoint.attach_tcp_socket(stream).await.unwrap_err();
    assert!(matches!(err, EndpointError::TransportConflict("ipc")));
    assert!(mocks.bus.contains("already has an IPC instance running"));

    endpoint.close_external().await;
}

#[tokio::test]
async fn run_ipc_fails_while_tcp_is_live() {
    let dir = helper_dir();
    let (endpoint, _mocks, _probe) = endpoint_with_mocks(ipc_config(&dir)).await;
    endpoint.set_binary("petrel_helper", Vec::new()).await;

    let _peer = TestPeer::attach(&endpoint).await;

    let err = endpoint.run_ipc().await.unwrap_err();
    assert!(matches!(err, EndpointError::TransportConflict("tcp")));
    // A failed launch attempt leaves the endpoint stopped.
    assert!(!endpoint.is_running().await);
}

#[tokio::test]
async fn run_ipc_without_binary_fails_cleanly() {
    let (endpoint, mocks, probe) = endpoint_with_mocks(quiet_config()).await;

    let err = endpoint.run_ipc().await.unwrap_err();
    assert!(matches!(err, EndpointError::Launch { .. }));
    assert!(mocks.bus.contains("did not have an IPC binary"));
    assert!(!endpoint.is_running().await);
    // Nothing was open, so nothing funnels.
    assert!(!probe.fired());
}

#[tokio::test]
async fn soft_kill_removes_the_child_from_the_tracker() {
    let dir = helper_dir();
    let (endpoint, mocks, _probe) = endpoint_with_mocks(ipc_config(&dir)).await;
    endpoint.set_binary("petrel_helper", Vec::new()).await;
    endpoint.run_ipc().await.unwrap();

    let pid = mocks.tracker.registered.lock().unwrap()[0];

    endpoint.ipc_soft_kill().await;
    assert!(!endpoint.is_running().await);
    assert_eq!(*mocks.tracker.removed.lock().unwrap(), vec![pid]);

    // A later close must not remove the pid again.
    endpoint.close_external().await;
    assert_eq!(*mocks.tracker.removed.lock().unwrap(), vec![pid]);
}
