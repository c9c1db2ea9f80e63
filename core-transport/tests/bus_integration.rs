//! End-to-end tests of the bus over real sockets in a temporary runtime
//! directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use core_runtime::config::BridgeConfig;
use core_runtime::events::{BridgeEvent, ConnectionEvent, EventBus};
use core_transport::{
    ClientOptions, ConnectionState, Fault, PeerCredentials, TransportClient, TransportError,
    TransportServer, INTROSPECTABLE_INTERFACE, INTROSPECT_METHOD,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const ECHO: &str = "org.test.Echo";
const BUS: &str = "app-test.Echo";

fn config(dir: &TempDir) -> BridgeConfig {
    BridgeConfig::builder()
        .runtime_dir(dir.path())
        .max_frame_bytes(4096)
        .build()
        .unwrap()
}

fn echo_server(config: &BridgeConfig, calls: Arc<AtomicUsize>) -> TransportServer {
    let server = TransportServer::new(config, None);
    server.register_method(ECHO, move |_conn, method, args| {
        calls.fetch_add(1, Ordering::SeqCst);
        match method {
            "ping" => Ok(Value::String(
                args.as_str().unwrap_or_default().to_uppercase(),
            )),
            "echo" => Ok(args),
            "big" => Ok(Value::String("z".repeat(8192))),
            other => Err(Fault::no_such_method(ECHO, other)),
        }
    });
    server
}

async fn connect(server: &TransportServer, config: &BridgeConfig) -> TransportClient {
    TransportClient::connect(
        &server.client_address().unwrap(),
        ClientOptions::from_config(config),
    )
    .await
    .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = echo_server(&config, Arc::new(AtomicUsize::new(0)));
    server.start(BUS).await.unwrap();

    let client = connect(&server, &config).await;
    assert!(client.is_connected());

    let reply: String = client.call(ECHO, "ping", json!("x")).await.unwrap();
    assert_eq!(reply, "X");
    assert_eq!(client.pending_calls(), 0);
    assert!(server.active_connection().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_interface_never_reaches_a_handler() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let server = echo_server(&config, Arc::clone(&calls));
    server.start(BUS).await.unwrap();
    let client = connect(&server, &config).await;

    let err = client
        .call::<Value>("org.test.Missing", "ping", json!("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoSuchInterface(ref i) if i == "org.test.Missing"));

    let err = client
        .call::<Value>(ECHO, "nope", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoSuchMethod(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_registration_wins() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = echo_server(&config, Arc::new(AtomicUsize::new(0)));
    server.register_method(ECHO, |_conn, _method, _args| Ok(json!("second")));
    server.start(BUS).await.unwrap();
    let client = connect(&server, &config).await;

    let reply: String = client.call(ECHO, "ping", json!("x")).await.unwrap();
    assert_eq!(reply, "second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_and_address_before_start() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = TransportServer::new(&config, None);

    assert!(matches!(
        server.client_address(),
        Err(TransportError::NotStarted)
    ));

    server.start(BUS).await.unwrap();
    assert!(matches!(
        server.start(BUS).await,
        Err(TransportError::AlreadyStarted)
    ));

    let address = server.client_address().unwrap();
    assert_eq!(
        address,
        format!("unix:path={}", dir.path().join(".app-test.Echo").display())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_peer_sends_nothing() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let server = echo_server(&config, Arc::clone(&calls));
    server.set_peer_authenticator(Arc::new(|_peer: &PeerCredentials| false));
    server.start(BUS).await.unwrap();

    let err = TransportClient::connect(
        &server.client_address().unwrap(),
        ClientOptions::from_config(&config),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TransportError::Authentication));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(server.active_connection().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_own_uid_is_admitted() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = echo_server(&config, Arc::new(AtomicUsize::new(0)));
    server.start(BUS).await.unwrap();

    let first = connect(&server, &config).await;
    let uid = server.active_connection().unwrap().credentials().uid;
    first.close();
    wait_until(|| server.active_connection().is_none()).await;

    server.set_peer_authenticator(core_transport::allow_uid(uid));
    let client = connect(&server, &config).await;
    let reply: String = client.call(ECHO, "ping", json!("ok")).await.unwrap();
    assert_eq!(reply, "OK");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_peer_is_turned_away_until_first_leaves() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = echo_server(&config, Arc::new(AtomicUsize::new(0)));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&disconnects);
    server.set_disconnected_callback(move |_conn| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    server.start(BUS).await.unwrap();

    let first = connect(&server, &config).await;
    let err = TransportClient::connect(
        &server.client_address().unwrap(),
        ClientOptions::from_config(&config),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TransportError::Connection(_)));

    first.close();
    assert_eq!(first.state(), ConnectionState::Closed);
    assert!(matches!(
        first.call::<Value>(ECHO, "ping", json!("x")).await,
        Err(TransportError::NotConnected)
    ));

    wait_until(|| disconnects.load(Ordering::SeqCst) == 1).await;
    let second = connect(&server, &config).await;
    let reply: String = second.call(ECHO, "ping", json!("again")).await.unwrap();
    assert_eq!(reply, "AGAIN");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signals_reach_the_interface_callback() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = TransportServer::new(&config, None);
    server.register_method(ECHO, |conn, _method, args| {
        conn.emit_signal(ECHO, "Echoed", args.clone())
            .map_err(|e| Fault::failed(e.to_string()))?;
        Ok(Value::Null)
    });
    server.start(BUS).await.unwrap();
    let client = connect(&server, &config).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.set_signal_callback(ECHO, move |signal, args| {
        tx.send((signal.to_string(), args)).ok();
    });

    let _: Value = client.call(ECHO, "shout", json!({"n": 1})).await.unwrap();
    let (signal, args) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal, "Echoed");
    assert_eq!(args, json!({"n": 1}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_properties() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = TransportServer::new(&config, None);
    let volume = Arc::new(Mutex::new(json!(3)));

    let read = Arc::clone(&volume);
    server.register_property_getter("org.test.Props", move |_conn, name| {
        (name == "Volume").then(|| read.lock().unwrap().clone())
    });
    let write = Arc::clone(&volume);
    server.register_property_setter("org.test.Props", move |_conn, name, value| {
        if name != "Volume" || !value.is_u64() {
            return false;
        }
        *write.lock().unwrap() = value;
        true
    });
    server.start(BUS).await.unwrap();
    let client = connect(&server, &config).await;

    let v: u64 = client.get_property("org.test.Props", "Volume").await.unwrap();
    assert_eq!(v, 3);

    client
        .set_property("org.test.Props", "Volume", json!(7))
        .await
        .unwrap();
    let v: u64 = client.get_property("org.test.Props", "Volume").await.unwrap();
    assert_eq!(v, 7);

    assert!(matches!(
        client.set_property("org.test.Props", "Volume", json!("loud")).await,
        Err(TransportError::RemoteFault(_))
    ));
    assert!(matches!(
        client.get_property::<Value>("org.test.Props", "Mute").await,
        Err(TransportError::NoSuchProperty(_))
    ));
    assert!(matches!(
        client.get_property::<Value>("org.test.Other", "Volume").await,
        Err(TransportError::NoSuchInterface(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_introspection_schema() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = TransportServer::new(&config, None);
    server.start(BUS).await.unwrap();
    let client = connect(&server, &config).await;

    assert!(matches!(
        client
            .call::<String>(INTROSPECTABLE_INTERFACE, INTROSPECT_METHOD, Value::Null)
            .await,
        Err(TransportError::RemoteFault(_))
    ));

    server.set_introspection_schema("<node name=\"/\"/>");
    let schema: String = client
        .call(INTROSPECTABLE_INTERFACE, INTROSPECT_METHOD, Value::Null)
        .await
        .unwrap();
    assert_eq!(schema, "<node name=\"/\"/>");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_call_fails_when_server_drops_peer() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = TransportServer::new(&config, None);
    server.register_method(ECHO, |conn, _method, _args| {
        conn.close();
        Ok(Value::Null)
    });
    server.start(BUS).await.unwrap();
    let client = Arc::new(connect(&server, &config).await);

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.set_disconnected_callback(move || {
        tx.send(()).ok();
    });

    let caller = Arc::clone(&client);
    let result = tokio::task::spawn_blocking(move || {
        caller.call_blocking::<Value>(ECHO, "hang_up", Value::Null)
    })
    .await
    .unwrap();

    assert!(matches!(result, Err(TransportError::ConnectionLost)));
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.pending_calls(), 0);
    assert!(matches!(
        client.call::<Value>(ECHO, "again", Value::Null).await,
        Err(TransportError::ConnectionLost)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_blocking_calls_get_their_own_replies() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = echo_server(&config, Arc::new(AtomicUsize::new(0)));
    server.start(BUS).await.unwrap();
    let client = Arc::new(connect(&server, &config).await);

    let callers: Vec<_> = (0..8u64)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::task::spawn_blocking(move || {
                client.call_blocking::<u64>(ECHO, "echo", json!(i))
            })
        })
        .collect();

    for (i, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.await.unwrap().unwrap(), i as u64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frames_fail_only_their_call() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let server = echo_server(&config, Arc::new(AtomicUsize::new(0)));
    server.start(BUS).await.unwrap();
    let client = connect(&server, &config).await;

    let err = client
        .call::<Value>(ECHO, "echo", json!("a".repeat(8192)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::FrameTooLarge { limit: 4096, .. }));

    let err = client.call::<Value>(ECHO, "big", Value::Null).await.unwrap_err();
    assert!(matches!(err, TransportError::RemoteFault(ref m) if m.contains("4096")));

    let reply: String = client.call(ECHO, "ping", json!("still")).await.unwrap();
    assert_eq!(reply, "STILL");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_runs_handler_without_reply() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let calls = Arc::new(AtomicUsize::new(0));
    let server = echo_server(&config, Arc::clone(&calls));
    server.start(BUS).await.unwrap();
    let client = connect(&server, &config).await;

    client.post(ECHO, "ping", json!("fire")).unwrap();
    client.post(ECHO, "unknown", Value::Null).unwrap();
    wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_events_and_socket_cleanup() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let events = EventBus::new(32);
    let mut rx = events.subscribe();

    let server = TransportServer::new(&config, Some(events.clone()));
    server.start(BUS).await.unwrap();
    let socket = config.socket_path(BUS);
    assert!(socket.exists());

    let client = TransportClient::connect(
        &server.client_address().unwrap(),
        ClientOptions::from_config(&config).with_event_bus(events.clone()),
    )
    .await
    .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(
        e,
        BridgeEvent::Connection(ConnectionEvent::Listening { .. })
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        BridgeEvent::Connection(ConnectionEvent::PeerAccepted { .. })
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        BridgeEvent::Connection(ConnectionEvent::Connected { .. })
    )));

    server.shutdown();
    assert!(!socket.exists());
    assert!(!server.is_started());
    wait_until(|| !client.is_connected()).await;
}
