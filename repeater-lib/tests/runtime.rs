//! Repeater runtime against an in-memory bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use repeater_lib::bus::{Bus, Handler, Message, ReconnectionFailureCallback};
use repeater_lib::executor::ExecutorRegistry;
use repeater_lib::handlers::{NetworkTestHandler, RegisterScriptsHandler, SendRequestHandler};
use repeater_lib::messages::RejectReason;
use repeater_lib::scripts::{ScriptOrigin, VirtualScripts};
use repeater_lib::{Error, RepeaterRuntime, Result, RuntimeState};
use serde_json::{Value, json};

#[derive(Default)]
struct MockBus {
    reply: Mutex<Value>,
    sent: Mutex<Vec<Message>>,
    published: Mutex<Vec<Message>>,
    subscribed: Mutex<Vec<&'static str>>,
    destroyed: Mutex<u32>,
    on_failure: Mutex<Option<ReconnectionFailureCallback>>,
}

impl MockBus {
    fn replying(reply: Value) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            ..Default::default()
        })
    }

    fn statuses(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.message_type == "RepeaterStatusUpdated")
            .map(|m| m.payload["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn fail_connection(&self) {
        let callback = self.on_failure.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(Error::ReconnectionExhausted(3));
        }
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<Value> {
        self.sent.lock().unwrap().push(message);
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn subscribe(&self, handler: Arc<dyn Handler>) -> Result<()> {
        self.subscribed.lock().unwrap().push(handler.message_type());
        Ok(())
    }

    fn on_reconnection_failure(&self, callback: ReconnectionFailureCallback) {
        *self.on_failure.lock().unwrap() = Some(callback);
    }

    async fn destroy(&self) -> Result<()> {
        *self.destroyed.lock().unwrap() += 1;
        Ok(())
    }
}

fn runtime(bus: Arc<MockBus>, scripts: Arc<VirtualScripts>) -> Arc<RepeaterRuntime> {
    let handlers: Vec<Arc<dyn Handler>> = vec![
        Arc::new(RegisterScriptsHandler::new(scripts.clone())),
        Arc::new(NetworkTestHandler::new()),
        Arc::new(SendRequestHandler::new(ExecutorRegistry::new())),
    ];
    RepeaterRuntime::builder(bus, scripts, handlers, "1.2.0")
        .heartbeat_interval(Duration::from_secs(10))
        .build()
}

#[tokio::test]
async fn test_busy_rejection_subscribes_nothing() {
    let bus = MockBus::replying(json!({"error": "busy"}));
    let runtime = runtime(bus.clone(), Arc::new(VirtualScripts::default()));

    let err = runtime.run("rep-1", false).await.unwrap_err();
    match &err {
        Error::Rejected(rejection) => {
            assert_eq!(rejection.reason, RejectReason::Busy);
            assert!(err.to_string().contains("rep-1"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.is_fatal());
    assert_eq!(runtime.state(), RuntimeState::Rejected);
    assert!(bus.subscribed.lock().unwrap().is_empty());
    assert!(bus.statuses().is_empty());

    runtime.close().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Closed);
    assert!(bus.statuses().is_empty());
}

#[tokio::test]
async fn test_successful_registration() {
    let bus = MockBus::replying(json!({"version": "1.2.0"}));
    let runtime = runtime(bus.clone(), Arc::new(VirtualScripts::default()));

    runtime.run("rep-1", false).await.unwrap();

    assert_eq!(runtime.state(), RuntimeState::Running);
    assert_eq!(
        *bus.subscribed.lock().unwrap(),
        vec!["RepeaterScriptsUpdated", "NetworkTestingRequested", "ExecuteScript"]
    );
    assert_eq!(bus.statuses(), vec!["connected"]);

    let sent = bus.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, "RepeaterRegistering");
    assert_eq!(
        sent[0].payload,
        json!({"repeaterId": "rep-1", "version": "1.2.0", "localScriptsUsed": false})
    );
}

#[tokio::test]
async fn test_run_twice_is_noop() {
    let bus = MockBus::replying(json!({"version": "1.0.0"}));
    let runtime = runtime(bus.clone(), Arc::new(VirtualScripts::default()));

    runtime.run("rep-1", false).await.unwrap();
    runtime.run("rep-1", false).await.unwrap();

    assert_eq!(bus.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_remote_script_installed_on_registration() {
    let bus = MockBus::replying(json!({
        "version": "2.0.0",
        "script": {"*.internal": "function handle(o) { return o; }"}
    }));
    let scripts = Arc::new(VirtualScripts::default());
    let runtime = runtime(bus, scripts.clone());

    runtime.run("rep-1", false).await.unwrap();

    assert_eq!(scripts.size(), 1);
    assert!(scripts.find("api.internal").is_some());
}

#[tokio::test]
async fn test_remote_script_refused_with_local() {
    let bus = MockBus::replying(json!({"version": "1.2.0", "script": "remote"}));
    let scripts = Arc::new(VirtualScripts::default());
    scripts.set("*", ScriptOrigin::Local, "local").unwrap();
    let runtime = runtime(bus.clone(), scripts.clone());

    runtime.run("rep-1", false).await.unwrap();

    let snapshot = scripts.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].source(), "local");
    assert_eq!(bus.sent.lock().unwrap()[0].payload["localScriptsUsed"], true);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let bus = MockBus::replying(json!({"version": "1.2.0"}));
    let runtime = runtime(bus.clone(), Arc::new(VirtualScripts::default()));

    runtime.run("rep-1", false).await.unwrap();
    runtime.close().await.unwrap();
    runtime.close().await.unwrap();

    assert_eq!(bus.statuses(), vec!["connected", "disconnected"]);
    assert_eq!(*bus.destroyed.lock().unwrap(), 1);
    assert!(matches!(
        runtime.run("rep-1", false).await,
        Err(Error::InvalidState(RuntimeState::Closed))
    ));
}

#[tokio::test]
async fn test_close_before_run() {
    let bus = MockBus::replying(json!({"version": "1.2.0"}));
    let runtime = runtime(bus.clone(), Arc::new(VirtualScripts::default()));

    runtime.close().await.unwrap();
    assert!(bus.statuses().is_empty());
    assert_eq!(*bus.destroyed.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_publishes_connected() {
    let bus = MockBus::replying(json!({"version": "1.2.0"}));
    let runtime = runtime(bus.clone(), Arc::new(VirtualScripts::default()));

    runtime.run("rep-1", false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(bus.statuses(), vec!["connected", "connected", "connected"]);

    runtime.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(bus.statuses().last().map(String::as_str), Some("disconnected"));
    assert_eq!(bus.statuses().len(), 4);
}

#[tokio::test]
async fn test_reconnection_failure_terminates() {
    let bus = MockBus::replying(json!({"version": "1.2.0"}));
    let runtime = runtime(bus.clone(), Arc::new(VirtualScripts::default()));
    let mut terminated = runtime.terminated();

    runtime.run("rep-1", false).await.unwrap();
    bus.fail_connection();

    terminated.wait_for(|t| *t).await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Closed);
    assert_eq!(*bus.destroyed.lock().unwrap(), 1);
}
