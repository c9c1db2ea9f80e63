//! Content client and extension host talking over a real bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use core_extension::{
    AsyncReply, Extension, ExtensionHost, ExtensionInstance, InstanceContext, InstanceId,
    IpcClient, Message, MessageKind, ProtocolError,
};
use core_runtime::config::BridgeConfig;
use core_runtime::events::{BridgeEvent, EventBus, ExtensionEvent};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

const APP: &str = "app-under-test";

/// Uppercasing echo that can also hold async calls unanswered.
struct Echo {
    held: Arc<Mutex<Vec<AsyncReply>>>,
}

struct EchoInstance {
    context: InstanceContext,
    held: Arc<Mutex<Vec<AsyncReply>>>,
}

impl Extension for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn javascript_api(&self) -> &str {
        "exports.ping = function (s) { return extension.internal.sendSyncMessage(s); };"
    }

    fn entry_points(&self) -> Vec<String> {
        vec!["tizen.echo".to_string()]
    }

    fn create_instance(&self, context: InstanceContext) -> Option<Box<dyn ExtensionInstance>> {
        Some(Box::new(EchoInstance {
            context,
            held: Arc::clone(&self.held),
        }))
    }
}

impl ExtensionInstance for EchoInstance {
    fn handle_message(&mut self, message: Value) {
        self.context.post_message(json!({ "posted": message })).ok();
    }

    fn handle_sync_message(&mut self, method: &str, args: Value) -> Result<Value, String> {
        match method {
            "ping" => Ok(Value::String(
                args.as_str().unwrap_or_default().to_uppercase(),
            )),
            "notify" => {
                self.context
                    .post_message(args)
                    .map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            other => Err(format!("unknown method {}", other)),
        }
    }

    fn handle_async_message(&mut self, method: &str, args: Value, reply: AsyncReply) {
        match method {
            "hold" => self.held.lock().unwrap().push(reply),
            "drop" => drop(reply),
            _ => match self.handle_sync_message(method, args) {
                Ok(value) => reply.send(value),
                Err(e) => reply.fail(e),
            },
        }
    }
}

struct Blank;

impl Extension for Blank {
    fn name(&self) -> &str {
        "blank"
    }

    fn create_instance(&self, _context: InstanceContext) -> Option<Box<dyn ExtensionInstance>> {
        None
    }
}

struct Harness {
    _dir: TempDir,
    host: ExtensionHost,
    client: Arc<IpcClient>,
    held: Arc<Mutex<Vec<AsyncReply>>>,
    events: EventBus,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = BridgeConfig::builder()
        .runtime_dir(dir.path())
        .build()
        .unwrap();
    let events = EventBus::new(64);

    let held = Arc::new(Mutex::new(Vec::new()));
    let host = ExtensionHost::new(&config, Some(events.clone()));
    host.register_extension(Arc::new(Echo {
        held: Arc::clone(&held),
    }))
    .unwrap();
    host.register_extension(Arc::new(Blank)).unwrap();
    host.start(APP).await.unwrap();

    let client = IpcClient::connect(&config, APP, Some(events.clone()))
        .await
        .unwrap();

    Harness {
        _dir: dir,
        host,
        client: Arc::new(client),
        held,
        events,
    }
}

async fn create(client: &IpcClient, routing_id: i32, extension: &str) -> InstanceId {
    let reply = client
        .send_sync_message_async(
            Message::new(MessageKind::CreateInstance, routing_id).with_value(json!(extension)),
        )
        .await
        .unwrap();
    InstanceId::parse(reply.value.as_str().unwrap()).unwrap()
}

fn call(routing_id: i32, instance: InstanceId, method: &str, args: Value) -> Message {
    Message::new(MessageKind::CallSync, routing_id)
        .with_instance(instance)
        .with_method(method)
        .with_value(args)
}

fn async_call(routing_id: i32, instance: InstanceId, method: &str, args: Value) -> Message {
    Message::new(MessageKind::CallAsync, routing_id)
        .with_instance(instance)
        .with_method(method)
        .with_value(args)
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

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enumerate_lists_metadata() {
    let h = harness().await;

    let reply = h
        .client
        .send_sync_message_async(Message::new(MessageKind::GetExtensions, 1))
        .await
        .unwrap();
    let names: Vec<&str> = reply
        .value
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["blank", "echo"]);
    assert_eq!(reply.value[1]["entry_points"], json!(["tizen.echo"]));

    let api = h
        .client
        .send_sync_message_async(
            Message::new(MessageKind::GetApiScript, 1).with_value(json!("echo")),
        )
        .await
        .unwrap();
    assert!(api.value.as_str().unwrap().starts_with("exports.ping"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_on_destroyed_instance_are_invalid() {
    let h = harness().await;
    let a = create(&h.client, 1, "echo").await;
    assert_eq!(h.host.instance_count(), 1);

    let reply = h
        .client
        .send_sync_message_async(call(1, a, "ping", json!("x")))
        .await
        .unwrap();
    assert_eq!(reply.value, json!("X"));

    h.client
        .send_sync_message_async(Message::new(MessageKind::DestroyInstance, 1).with_instance(a))
        .await
        .unwrap();
    assert_eq!(h.host.instance_count(), 0);

    let err = h
        .client
        .send_sync_message_async(call(1, a, "ping", json!("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidInstance(_)));

    let err = h
        .client
        .send_sync_message_async(
            Message::new(MessageKind::CreateInstance, 1).with_value(json!("missing")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownExtension(ref n) if n == "missing"));

    let err = h
        .client
        .send_sync_message_async(
            Message::new(MessageKind::CreateInstance, 1).with_value(json!("blank")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::RemoteFault(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_instance_fault_is_remote_fault() {
    let h = harness().await;
    let a = create(&h.client, 1, "echo").await;

    let err = h
        .client
        .send_sync_message_async(call(1, a, "explode", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::RemoteFault(ref m) if m == "unknown method explode"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sync_calls_do_not_cross_talk() {
    let h = harness().await;
    let a = create(&h.client, 1, "echo").await;

    let callers: Vec<_> = (0..8)
        .map(|i| {
            let client = Arc::clone(&h.client);
            tokio::task::spawn_blocking(move || {
                let word = format!("word{}", i);
                let reply = client
                    .send_sync_message(call(1, a, "ping", json!(word)))
                    .unwrap();
                (word.to_uppercase(), reply.value)
            })
        })
        .collect();

    for caller in callers {
        let (expected, got) = caller.await.unwrap();
        assert_eq!(got, json!(expected));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_completion_runs_once_with_reply() {
    let h = harness().await;
    let a = create(&h.client, 1, "echo").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let call_id = h
        .client
        .send_async_message(1, async_call(1, a, "ping", json!("hi")), move |result| {
            tx.send(result).ok();
        })
        .unwrap();

    let reply = recv(&mut rx).await.unwrap();
    assert_eq!(reply.kind, MessageKind::PostMessageToJs);
    assert_eq!(reply.reply_to, Some(call_id));
    assert_eq!(reply.value, json!("HI"));
    assert_eq!(h.client.pending_calls(), 0);

    // The completion was consumed, so the channel's only sender is gone.
    assert!(rx.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_failures_still_complete() {
    let h = harness().await;
    let a = create(&h.client, 1, "echo").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let missing = InstanceId::new();
    for message in [
        async_call(1, missing, "ping", json!("x")),
        async_call(1, a, "drop", Value::Null),
    ] {
        let tx = tx.clone();
        h.client
            .send_async_message(1, message, move |result| {
                tx.send(result).ok();
            })
            .unwrap();
    }

    let first = recv(&mut rx).await;
    assert!(matches!(first, Err(ProtocolError::InvalidInstance(_))));
    let second = recv(&mut rx).await;
    assert!(matches!(second, Err(ProtocolError::RemoteFault(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_teardown_flushes_every_pending_call() {
    let h = harness().await;
    let a = create(&h.client, 1, "echo").await;
    let mut events = h.events.subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for _ in 0..3 {
        let tx = tx.clone();
        h.client
            .send_async_message(1, async_call(1, a, "hold", Value::Null), move |result| {
                tx.send(result).ok();
            })
            .unwrap();
    }
    drop(tx);
    let held = Arc::clone(&h.held);
    wait_until(move || held.lock().unwrap().len() == 3).await;
    assert_eq!(h.client.pending_calls(), 3);

    h.host.shutdown();

    for _ in 0..3 {
        let result = recv(&mut rx).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionLost)));
    }
    assert!(rx.recv().await.is_none());
    assert_eq!(h.client.pending_calls(), 0);
    assert!(!h.client.is_connected());

    let flushed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(BridgeEvent::Extension(ExtensionEvent::PendingCallsFlushed { count, .. })) =
                events.recv().await
            {
                return count;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(flushed, 3);

    let err = h
        .client
        .send_sync_message_async(call(1, a, "ping", json!("x")))
        .await
        .unwrap_err();
    assert!(err.is_connection_lost());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_owner_drops_only_its_calls() {
    let h = harness().await;
    let a = create(&h.client, 1, "echo").await;
    let b = create(&h.client, 1, "echo").await;
    let runs = Arc::new(AtomicUsize::new(0));

    // Two owners on the same view.
    for (owner, instance) in [(10, a), (10, a), (20, b)] {
        let runs = Arc::clone(&runs);
        h.client
            .send_async_message(
                owner,
                async_call(1, instance, "hold", Value::Null),
                move |_result| {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
    }
    let held = Arc::clone(&h.held);
    wait_until(move || held.lock().unwrap().len() == 3).await;

    assert_eq!(h.client.release_owner(10), 2);
    assert_eq!(h.client.pending_calls(), 1);

    // Answering the released calls reaches nobody.
    let replies: Vec<AsyncReply> = h.held.lock().unwrap().drain(..).collect();
    for reply in replies {
        reply.send(json!("late"));
    }
    let runs_seen = Arc::clone(&runs);
    wait_until(move || runs_seen.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_reach_the_listener() {
    let h = harness().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.client.set_message_listener(move |message| {
        tx.send(message).ok();
    });

    let a = create(&h.client, 7, "echo").await;
    let endpoint = recv(&mut rx).await;
    assert_eq!(endpoint.kind, MessageKind::EndpointCreated);
    assert_eq!(endpoint.routing_id, 7);

    h.client
        .send_sync_message_async(call(7, a, "notify", json!({"battery": 80})))
        .await
        .unwrap();
    let event = recv(&mut rx).await;
    assert_eq!(event.kind, MessageKind::PostMessageToJs);
    assert_eq!(event.instance, Some(a));
    assert_eq!(event.reply_to, None);
    assert_eq!(event.value, json!({"battery": 80}));

    h.client
        .send_message(
            Message::new(MessageKind::PostMessage, 7)
                .with_instance(a)
                .with_value(json!("hello")),
        )
        .unwrap();
    let event = recv(&mut rx).await;
    assert_eq!(event.value, json!({"posted": "hello"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departed_peer_loses_its_instances() {
    let h = harness().await;
    create(&h.client, 1, "echo").await;
    create(&h.client, 2, "echo").await;
    assert_eq!(h.host.instance_count(), 2);

    h.client.close();
    wait_until(|| h.host.instance_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_refuses_conflicting_extensions() {
    let h = harness().await;
    assert!(matches!(
        h.host.register_extension(Arc::new(Blank)),
        Err(ProtocolError::DuplicateExtension(_))
    ));
    assert_eq!(h.host.extension_names(), vec!["blank", "echo"]);
}
