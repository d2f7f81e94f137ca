use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::process::ProcessHandle;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// 上游 MJPEG 字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// 一次成功启动的产物：上游字节流与进程句柄
pub struct Upstream {
    pub stream: ByteStream,
    pub process: ProcessHandle,
}

/// 摄像头后端：负责拉起采集进程并等待其就绪
#[async_trait]
pub trait CameraBackend: Send + Sync + 'static {
    async fn start(&self) -> Result<Upstream, CameraError>;
}

/// 基于 mjpg_streamer 的摄像头后端
pub struct MjpgStreamer {
    config: CameraConfig,
    client: reqwest::Client,
}

impl MjpgStreamer {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// `-o` / `-i` 插件参数
    fn plugin_args(&self) -> Vec<String> {
        let cfg = &self.config;
        vec![
            "-o".to_string(),
            format!("output_http.so -w {} -p {}", cfg.www_dir, cfg.port),
            "-i".to_string(),
            format!(
                "input_raspicam.so -x {} -y {} -fps {}",
                cfg.width, cfg.height, cfg.fps
            ),
        ]
    }

    fn check_memory(&self) -> Result<(), CameraError> {
        match sys_info::mem_info() {
            Ok(mem) => {
                if mem.avail < self.config.min_free_mem_kb {
                    return Err(CameraError::ProcessStart(format!(
                        "insufficient system memory ({} KB available)",
                        mem.avail
                    )));
                }
            }
            Err(e) => {
                // 无法获取内存信息时只记录警告
                warn!("Failed to check memory usage: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CameraBackend for MjpgStreamer {
    /// 启动 mjpg_streamer 并打开其 HTTP 流
    ///
    /// # 错误处理
    /// - 内存不足、进程无法启动、宽限期内未就绪均返回 `ProcessStart`
    async fn start(&self) -> Result<Upstream, CameraError> {
        // 1. 检查系统内存是否足够
        self.check_memory()?;

        // 2. 构建命令并启动子进程
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.plugin_args());
        cmd.current_dir(&self.config.working_dir);
        cmd.env("LD_LIBRARY_PATH", &self.config.working_dir);
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", self.config.binary, e);
            CameraError::ProcessStart(e.to_string())
        })?;
        let mut process = ProcessHandle::supervise(child);
        info!(
            "Camera process started (pid {:?}), {}x{}@{}fps",
            process.pid(),
            self.config.width,
            self.config.height,
            self.config.fps
        );

        // 3. 在宽限期内轮询 HTTP 端点直到可以拉流
        let url = self.config.stream_url();
        let deadline = Instant::now() + self.config.start_grace();
        let mut attempt = 0u32;
        let response = loop {
            if process.has_exited() {
                return Err(CameraError::ProcessStart(
                    "process exited during startup".to_string(),
                ));
            }

            // 单次请求同样受宽限期约束，端点无响应时不会一直挂起
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.client.get(&url).send()).await {
                Ok(Ok(resp)) if resp.status().is_success() => break resp,
                Ok(Ok(resp)) => {
                    warn!("Camera endpoint not ready yet: HTTP {}", resp.status());
                }
                Ok(Err(e)) => {
                    if attempt == 0 {
                        info!("Waiting for camera endpoint {}: {}", url, e);
                    }
                }
                Err(_) => {
                    warn!("Camera endpoint {} did not answer in time", url);
                }
            }
            attempt += 1;

            if Instant::now() >= deadline {
                process.terminate();
                return Err(CameraError::ProcessStart(format!(
                    "endpoint not ready after {}ms",
                    self.config.start_grace_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(Upstream { stream, process })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_args_carry_capture_parameters() {
        let backend = MjpgStreamer::new(CameraConfig {
            port: 8081,
            width: 1280,
            height: 720,
            fps: 10,
            ..CameraConfig::default()
        });
        let args = backend.plugin_args();
        assert_eq!(args[0], "-o");
        assert_eq!(args[1], "output_http.so -w ./www -p 8081");
        assert_eq!(args[2], "-i");
        assert_eq!(args[3], "input_raspicam.so -x 1280 -y 720 -fps 10");
    }

    #[tokio::test]
    async fn silent_endpoint_fails_within_start_grace() {
        use std::os::unix::fs::PermissionsExt;

        // 接受连接但从不应答的端点
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        // 一直存活的假采集进程
        let dir = std::env::temp_dir().join(format!("garage-link-camera-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("fake_streamer.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = MjpgStreamer::new(CameraConfig {
            binary: script.to_string_lossy().into_owned(),
            working_dir: dir.to_string_lossy().into_owned(),
            port,
            start_grace_ms: 500,
            min_free_mem_kb: 0,
            ..CameraConfig::default()
        });

        let result = tokio::time::timeout(Duration::from_secs(5), backend.start())
            .await
            .expect("start should give up within the grace period");
        match result {
            Err(CameraError::ProcessStart(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("silent endpoint should not be ready"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_error() {
        let backend = MjpgStreamer::new(CameraConfig {
            binary: "/nonexistent/mjpg_streamer".to_string(),
            min_free_mem_kb: 0,
            ..CameraConfig::default()
        });
        match backend.start().await {
            Err(CameraError::ProcessStart(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("start should fail"),
        }
    }
}
