pub mod admin;
pub mod stream;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 注册HTTP路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/stream", get(stream::serve_stream)) // 实时画面
        .route("/snapshot", post(admin::take_snapshot)) // 手动抓拍
        .route("/door", post(admin::trigger_door)) // 触发门
        .route("/camera/status", get(admin::camera_status)) // 摄像头状态
        .route("/camera/stop", post(admin::camera_stop)) // 立即停止摄像头
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .with_state(state)
}
