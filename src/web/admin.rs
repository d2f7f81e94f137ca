use crate::broker::BrokerStatus;
use crate::state::SharedState;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;

/// 获取系统状态 API
/// 该处理函数返回系统的内存和负载信息，作为 JSON 响应
pub async fn sys_status() -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

#[derive(Debug, Serialize)]
pub struct CameraStatus {
    #[serde(flatten)]
    pub broker: BrokerStatus,
    pub snapshot_in_flight: bool,
    pub settle_snapshot_pending: bool,
    pub snapshot_url: String,
}

/// 摄像头状态 API
/// 返回引用计数、进程阶段、启动次数、待执行的停止以及快照状态
pub async fn camera_status(State(state): State<SharedState>) -> Json<CameraStatus> {
    Json(CameraStatus {
        broker: state.broker.status(),
        snapshot_in_flight: state.snapshots.in_flight(),
        settle_snapshot_pending: state.door.has_pending_snapshot(),
        snapshot_url: state.snapshots.public_url(),
    })
}

/// 立即停止摄像头 API
pub async fn camera_stop(State(state): State<SharedState>) -> String {
    state.broker.stop_now();
    "Camera stopped".to_string()
}

/// 手动抓拍 API
/// 与进行中的快照共享结果，返回公开地址
pub async fn take_snapshot(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match state.snapshots.capture().await {
        Ok(url) => Ok(Json(serde_json::json!({ "url": url }))),
        Err(e) => {
            error!("Snapshot request failed: {}", e);
            Err((StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DoorRequest {
    #[serde(default)]
    pub action: Option<String>,
}

/// 手动触发门 API
pub async fn trigger_door(
    State(state): State<SharedState>,
    payload: Option<Json<DoorRequest>>,
) -> Result<String, (StatusCode, String)> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let action = request.action.map(|a| a.to_lowercase());

    state
        .door
        .trigger(action.as_deref())
        .await
        .map(|_| "Door triggered".to_string())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
