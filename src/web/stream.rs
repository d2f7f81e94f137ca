use crate::state::SharedState;
use axum::{
    body::Body,
    extract::State,
    http::{header, Response, StatusCode},
};
use tracing::{error, info};

/// mjpg_streamer 的 multipart 边界
const BOUNDARY: &str = "boundarydonotcross";

/// 实时画面代理
///
/// 为每个连接申请一个消费者；客户端断开时响应体被丢弃，
/// 消费者随之关闭并归还引用计数。
pub async fn serve_stream(
    State(state): State<SharedState>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. 申请消费者，摄像头未运行时冷启动
    let consumer = state.broker.acquire().await.map_err(|e| {
        error!("Failed to open camera stream: {}", e);
        (StatusCode::BAD_GATEWAY, e.to_string())
    })?;
    info!("Viewer attached as consumer {}.", consumer.id());

    // 2. 转发复用后的数据直到客户端断开
    let body = Body::from_stream(consumer);

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace;boundary={}", BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
