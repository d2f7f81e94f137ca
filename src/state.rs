use crate::broker::ResourceBroker;
use crate::door::DoorController;
use crate::snapshot::SnapshotCoordinator;
use std::sync::Arc;

/// 全局应用上下文
///
/// 摄像头代理、快照协调器与门控制器在启动时显式构造，
/// 由 HTTP 处理器与命令分发共享。
pub struct AppState {
    pub broker: ResourceBroker,
    pub snapshots: SnapshotCoordinator,
    pub door: Arc<DoorController>,
}

impl AppState {
    /// 进程退出前的清理：取消待执行的快照并立即停止摄像头
    pub fn shutdown(&self) {
        self.door.shutdown();
        self.broker.stop_now();
    }
}

pub type SharedState = Arc<AppState>;
