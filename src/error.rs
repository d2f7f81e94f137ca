//! 摄像头链路的错误类型
//!
//! 同一个快照结果需要分发给所有等待者，所以错误类型必须可以 Clone，
//! 底层错误统一转成字符串保存。

/// 摄像头、快照与门控的领域错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    /// 进程未能在启动宽限期内就绪
    #[error("camera process failed to start: {0}")]
    ProcessStart(String),

    /// 有消费者时进程意外退出
    #[error("camera process exited unexpectedly: {0}")]
    ProcessCrash(String),

    /// 上游流被正常关闭 (停止摄像头)
    #[error("camera stream ended")]
    StreamEnded,

    /// 消费者读取过慢被断开
    #[error("consumer dropped: too slow to keep up with the camera stream")]
    SinkBackpressure,

    #[error("snapshot upload failed: {0}")]
    Upload(String),

    #[error("no complete frame within {0}s")]
    CaptureTimeout(u64),

    #[error("gpio error: {0}")]
    Gpio(String),
}
