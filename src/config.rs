use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub door: DoorConfig,
    pub storage: StorageConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
}

/// mjpg_streamer 进程及采集参数
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CameraConfig {
    pub binary: String,
    /// 进程工作目录，同时作为 LD_LIBRARY_PATH
    pub working_dir: String,
    /// output_http.so 的 www 目录
    pub www_dir: String,
    pub port: u16,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// 冷启动等待就绪的最长时间 (毫秒)
    pub start_grace_ms: u64,
    /// 最后一个消费者离开后延迟停止的时间 (秒)
    pub idle_grace_sec: u64,
    /// 每个消费者的缓冲块数，写满即断开
    pub sink_buffer: usize,
    /// 启动前要求的最小可用内存 (KB)
    pub min_free_mem_kb: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            binary: "mjpg_streamer".to_string(),
            working_dir: ".".to_string(),
            www_dir: "./www".to_string(),
            port: 8080,
            width: 640,
            height: 480,
            fps: 15,
            start_grace_ms: 2000,
            idle_grace_sec: 30,
            sink_buffer: 64,
            min_free_mem_kb: 5120,
        }
    }
}

impl CameraConfig {
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_sec)
    }

    pub fn stream_url(&self) -> String {
        format!("http://127.0.0.1:{}/?action=stream", self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DoorConfig {
    /// BCM 引脚编号
    pub pin: u32,
    pub gpio_root: String,
    pub pulse_ms: u64,
    /// 门到位后再拍照的等待时间 (秒)
    pub settle_sec: u64,
}

impl Default for DoorConfig {
    fn default() -> Self {
        Self {
            pin: 18,
            gpio_root: "/sys/class/gpio".to_string(),
            pulse_ms: 500,
            settle_sec: 20,
        }
    }
}

impl DoorConfig {
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_sec)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// 允许写成 gs://bucket
    pub bucket: String,
    #[serde(default = "default_object_path")]
    pub object_path: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_capture_timeout_sec")]
    pub capture_timeout_sec: u64,
    /// 上传 + 公开的最长时间 (秒)
    #[serde(default = "default_upload_timeout_sec")]
    pub upload_timeout_sec: u64,
}

impl StorageConfig {
    pub fn bucket_name(&self) -> &str {
        self.bucket.trim_start_matches("gs://").trim_end_matches('/')
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_sec)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_sec)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    /// 例如 https://my-garage.firebaseio.com
    pub database_url: String,
    #[serde(default)]
    pub auth: Option<String>,

    /// 断线重连策略
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大连续失败次数 (0 表示无限重试)
    pub max_attempts: u32,
    /// 初始退避时间 (秒)
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    pub max_backoff_sec: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_sec: 2,
            max_backoff_sec: 60,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的退避时间 (指数退避，封顶 max_backoff_sec)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let secs = std::cmp::min(
            self.max_backoff_sec,
            self.initial_backoff_sec.saturating_mul(factor),
        );
        Duration::from_secs(secs)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}

fn default_object_path() -> String {
    "images/door-snap.jpg".to_string()
}

fn default_capture_timeout_sec() -> u64 {
    10
}

fn default_upload_timeout_sec() -> u64 {
    30
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(content)?;
        Ok(config)
    }
}
