use crate::door::DoorController;
use crate::snapshot::SnapshotCoordinator;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 命令源中的一条原始记录，`payload` 为 None 表示删除或过期
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub key: String,
    pub payload: Option<Value>,
}

/// 命令源：只需要支持按 key 删除 (消费确认)
#[async_trait]
pub trait CommandFeed: Send + Sync + 'static {
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// 已解析的命令，action / query 统一小写
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub key: String,
    pub action: String,
    pub query: String,
}

impl Command {
    /// 删除、空记录或非对象负载不构成命令
    pub fn from_event(event: &FeedEvent) -> Option<Self> {
        let payload = event.payload.as_ref()?.as_object()?;
        if event.key.is_empty() {
            return None;
        }
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase()
        };
        Some(Self {
            key: event.key.clone(),
            action: field("action"),
            query: field("query"),
        })
    }
}

/// 分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Door,
    Snapshot,
    Unknown,
    Ignored,
}

/// 把外部命令路由到门控或快照
pub struct CommandDispatcher {
    feed: Arc<dyn CommandFeed>,
    door: Arc<DoorController>,
    snapshots: SnapshotCoordinator,
}

impl CommandDispatcher {
    pub fn new(
        feed: Arc<dyn CommandFeed>,
        door: Arc<DoorController>,
        snapshots: SnapshotCoordinator,
    ) -> Self {
        Self {
            feed,
            door,
            snapshots,
        }
    }

    /// 处理一条记录
    ///
    /// # 流程
    /// - 删除/空记录直接忽略
    /// - 立即从命令源删除 (至多一次消费)，删除失败不影响后续路由
    /// - Activate 触发门，Snapshot 在后台抓拍，其他 key 忽略
    pub async fn dispatch(&self, event: FeedEvent) -> Route {
        let Some(command) = Command::from_event(&event) else {
            debug!("Feed entry [{}] is empty or deleted, skipping.", event.key);
            return Route::Ignored;
        };
        info!(
            "Command [{}] action={:?} query={:?}",
            command.key, command.action, command.query
        );

        if let Err(e) = self.feed.remove(&command.key).await {
            warn!("Failed to consume feed entry [{}]: {}", command.key, e);
        }

        match command.key.as_str() {
            "Activate" => {
                let action = (!command.action.is_empty()).then_some(command.action.as_str());
                if let Err(e) = self.door.trigger(action).await {
                    error!("Door trigger failed: {}", e);
                }
                Route::Door
            }
            "Snapshot" => {
                let snapshots = self.snapshots.clone();
                tokio::spawn(async move {
                    if let Err(e) = snapshots.capture().await {
                        error!("Requested snapshot failed: {}", e);
                    }
                });
                Route::Snapshot
            }
            other => {
                debug!("Unknown command [{}] ignored.", other);
                Route::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ResourceBroker;
    use crate::storage::ObjectStore;
    use crate::testing::{fake_jpeg, FakeCamera, FakeFeed, FakePin, FakeStore};
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        dispatcher: CommandDispatcher,
        feed: Arc<FakeFeed>,
        pin: Arc<FakePin>,
        store: Arc<FakeStore>,
        camera: Arc<FakeCamera>,
        broker: ResourceBroker,
    }

    fn rig() -> Rig {
        let camera = FakeCamera::new();
        camera.feed_frames(fake_jpeg(b"garage"));
        let store = FakeStore::new("garage-cam");
        let pin = FakePin::new();
        let feed = FakeFeed::new();
        let broker = ResourceBroker::new(camera.clone(), Duration::from_secs(30), 8);
        let snapshots = SnapshotCoordinator::new(
            broker.clone(),
            store.clone(),
            "images/door-snap.jpg",
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        let door = Arc::new(DoorController::new(
            pin.clone(),
            snapshots.clone(),
            Duration::from_millis(500),
            Duration::from_secs(20),
        ));
        Rig {
            dispatcher: CommandDispatcher::new(feed.clone(), door, snapshots),
            feed,
            pin,
            store,
            camera,
            broker,
        }
    }

    fn event(key: &str, payload: Option<Value>) -> FeedEvent {
        FeedEvent {
            key: key.to_string(),
            payload,
        }
    }

    #[test]
    fn command_fields_are_lowercased() {
        let cmd = Command::from_event(&event(
            "Activate",
            Some(json!({"action": "OPEN", "query": "Now"})),
        ))
        .expect("command");
        assert_eq!(cmd.action, "open");
        assert_eq!(cmd.query, "now");

        let cmd = Command::from_event(&event("Snapshot", Some(json!({})))).expect("command");
        assert_eq!(cmd.action, "");
        assert_eq!(cmd.query, "");
    }

    #[test]
    fn deletions_are_not_commands() {
        assert!(Command::from_event(&event("Activate", None)).is_none());
        assert!(Command::from_event(&event("Activate", Some(Value::Null))).is_none());
        assert!(Command::from_event(&event("Activate", Some(json!("text")))).is_none());
        assert!(Command::from_event(&event("", Some(json!({})))).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_events_are_ignored_and_not_consumed() {
        let rig = rig();
        assert_eq!(rig.dispatcher.dispatch(event("Activate", None)).await, Route::Ignored);
        assert!(rig.feed.removed().is_empty());
        assert!(rig.pin.pulses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_keys_are_consumed_and_ignored() {
        let rig = rig();
        let route = rig
            .dispatcher
            .dispatch(event("Reboot", Some(json!({"action": "now"}))))
            .await;
        assert_eq!(route, Route::Unknown);
        assert_eq!(rig.feed.removed(), vec!["Reboot".to_string()]);
        assert!(rig.pin.pulses().is_empty());
        assert_eq!(rig.camera.starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_consumed_even_when_removal_fails() {
        let rig = rig();
        rig.feed.fail_removals();
        let route = rig
            .dispatcher
            .dispatch(event("Activate", Some(json!({"action": "open"}))))
            .await;
        assert_eq!(route, Route::Door);
        assert_eq!(rig.pin.pulses().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_command_runs_in_background() {
        let rig = rig();
        let route = rig
            .dispatcher
            .dispatch(event("Snapshot", Some(json!({"action": ""}))))
            .await;
        assert_eq!(route, Route::Snapshot);
        assert_eq!(rig.feed.removed(), vec!["Snapshot".to_string()]);

        rig.store.wait_for_writes(1).await;
        assert_eq!(
            rig.store.public_paths(),
            vec!["images/door-snap.jpg".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activate_end_to_end_yields_one_settle_snapshot() {
        let rig = rig();
        let route = rig
            .dispatcher
            .dispatch(event("Activate", Some(json!({"action": "Open", "query": ""}))))
            .await;
        assert_eq!(route, Route::Door);
        assert_eq!(rig.feed.removed(), vec!["Activate".to_string()]);
        assert_eq!(rig.pin.pulses(), vec![Duration::from_millis(500)]);

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(rig.store.writes().is_empty());

        rig.store.wait_for_writes(1).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rig.store.writes().len(), 1);
        assert_eq!(rig.camera.starts(), 1);
        assert_eq!(
            rig.store.public_url("images/door-snap.jpg"),
            "https://storage.googleapis.com/garage-cam/images/door-snap.jpg"
        );

        // 快照消费者已归还，空闲宽限期后摄像头停止
        assert_eq!(rig.broker.status().ref_count, 0);
        assert!(!rig.broker.is_running());
    }
}
