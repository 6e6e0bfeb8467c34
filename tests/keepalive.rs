//! Keepalive protocol timing, driven through the running coordinator loop
//! with paused tokio time.

use presence_coordinator::bus::ControlPublisher;
use presence_coordinator::config::KeepaliveConfig;
use presence_coordinator::coordinator::{Coordinator, CoordinatorHandle};
use presence_coordinator::flags::RuntimeFlags;
use presence_coordinator::ids::ShardId;
use presence_coordinator::observer::{bootstrap_observer, ObserverHandle, StoreObserver};
use presence_coordinator::shard::{ShardHealth, ShardState};
use presence_coordinator::store::{KeyLayout, MemoryStore, StoreClient};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const OUTPUT: &str = "control-out";

struct Running {
    handle: CoordinatorHandle,
    store: Arc<MemoryStore>,
    keys: KeyLayout,
    state: ShardState,
    observer: ObserverHandle,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Running {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let keys = KeyLayout::default();
        let observer = bootstrap_observer(StoreObserver::new(
            store.clone(),
            keys.clone(),
            "events".to_string(),
            Arc::new(RuntimeFlags::new()),
        ))
        .await;
        let observer = ObserverHandle::spawn(observer);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let publisher = ControlPublisher::new(store.clone(), OUTPUT);
        tokio::spawn(publisher.run(control_rx));

        let state = ShardState::new("keepalive-test");
        let coordinator = Coordinator::new(
            observer.clone(),
            KeepaliveConfig::default(),
            control_tx,
            state.clone(),
        );
        let (handle, input_rx) = CoordinatorHandle::channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(coordinator.run(input_rx, shutdown_rx));

        Self {
            handle,
            store,
            keys,
            state,
            observer,
            shutdown_tx,
            task,
        }
    }

    async fn send(&self, message: Value) {
        self.handle.submit(message.to_string());
        advance(1).await;
    }

    async fn control(&self) -> Vec<Value> {
        self.store
            .published_on(OUTPUT)
            .await
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    async fn stop(self) {
        self.shutdown_tx.send(()).unwrap();
        self.task.await.unwrap();
    }
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn sync(id: Value, commands: Value) -> Value {
    json!({"id": id, "type": "syncWithState", "commands": commands})
}

#[tokio::test(start_paused = true)]
async fn test_silent_shard_is_probed_then_removed() {
    let running = Running::start().await;
    running
        .send(sync(
            json!(1),
            json!([
                {"type": "userConnectionNewEvent", "connectionId": "c1"},
                {"type": "userConnectionIdentificationEvent", "connectionId": "c1", "userId": 5},
                {"type": "userConnectionSubscribe", "connectionId": "c1", "userId": 5, "channel": "s"}
            ]),
        ))
        .await;
    let shard = ShardId::from(1);
    assert_eq!(running.state.connections(&shard), Some(1));

    // t = 1ms; default expire time is 60s from registration
    advance(59_998).await;
    assert!(running.control().await.is_empty());
    assert_eq!(running.state.get_health(&shard), Some(ShardHealth::Normal));

    advance(2).await;
    assert_eq!(running.control().await, vec![json!({"type": "checkAlive", "id": 1})]);
    assert_eq!(running.state.get_health(&shard), Some(ShardHealth::Probing));

    advance(10_000).await;
    assert_eq!(running.state.shard_count(), 0);

    running.observer.flush().await;
    assert!(running
        .store
        .smembers(running.keys.connection_ids())
        .await
        .unwrap()
        .is_empty());
    assert!(running.store.smembers(running.keys.streams()).await.unwrap().is_empty());

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_message_during_probe_cancels_removal() {
    let running = Running::start().await;
    running.send(sync(json!("edge"), json!([]))).await;

    advance(60_000).await;
    let shard = ShardId::from("edge");
    assert_eq!(running.state.get_health(&shard), Some(ShardHealth::Probing));

    running
        .send(json!({"id": "edge", "type": "keepAlive", "timeout": -1}))
        .await;
    assert_eq!(running.state.get_health(&shard), Some(ShardHealth::Normal));

    // Well past the probe window, still inside the renewed expire time
    advance(30_000).await;
    assert_eq!(running.state.shard_count(), 1);
    assert_eq!(running.control().await.len(), 1);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_timeout_scales_expire_time() {
    let running = Running::start().await;
    running.send(sync(json!(3), json!([]))).await;
    // 2000ms * 1.5
    running
        .send(json!({"id": 3, "type": "keepAlive", "timeout": 2000}))
        .await;

    advance(2_998).await;
    assert!(running.control().await.is_empty());

    advance(2).await;
    assert_eq!(running.control().await, vec![json!({"type": "checkAlive", "id": 3})]);

    // A negative timeout keeps the scaled expire time
    running
        .send(json!({"id": 3, "type": "keepAlive", "timeout": -1}))
        .await;
    advance(3_000).await;
    assert_eq!(running.control().await.len(), 2);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_message_does_not_renew() {
    let running = Running::start().await;
    running.send(sync(json!(1), json!([]))).await;

    advance(50_000).await;
    running.send(json!({"id": 1, "type": "notAThing"})).await;
    running
        .send(json!({"id": 1, "type": "userConnectionNewEvent"}))
        .await;

    // Still probed at the original 60s deadline
    advance(10_000).await;
    assert_eq!(running.control().await, vec![json!({"type": "checkAlive", "id": 1})]);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_check_alive_all_arms_every_probe() {
    let running = Running::start().await;
    running.send(sync(json!(1), json!([]))).await;
    running.send(sync(json!(2), json!([]))).await;

    running.handle.check_alive_all();
    advance(1).await;
    assert_eq!(running.control().await, vec![json!({"type": "checkAliveAll"})]);
    assert_eq!(running.state.probing_shards(), 2);

    running
        .send(json!({"id": 2, "type": "keepAlive", "timeout": -1}))
        .await;
    advance(10_000).await;

    assert!(running.state.get_health(&ShardId::from(1)).is_none());
    assert_eq!(running.state.get_health(&ShardId::from(2)), Some(ShardHealth::Normal));

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_sync_all_is_published() {
    let running = Running::start().await;

    running.handle.request_sync_all();
    advance(1).await;
    running
        .send(json!({"id": 8, "type": "keepAlive", "timeout": 1000}))
        .await;

    assert_eq!(
        running.control().await,
        vec![
            json!({"type": "requestSyncAll"}),
            json!({"type": "requestSync", "id": 8})
        ]
    );

    running.stop().await;
}
