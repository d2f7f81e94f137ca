//! 测试用的摄像头、存储、引脚与命令源替身

use crate::camera::{CameraBackend, Upstream};
use crate::command::CommandFeed;
use crate::error::CameraError;
use crate::gpio::DoorPin;
use crate::process::ProcessHandle;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

pub fn fake_jpeg(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8];
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

struct Live {
    tx: mpsc::Sender<Bytes>,
    crash: Option<oneshot::Sender<String>>,
}

/// 不启动真实进程的摄像头后端
#[derive(Default)]
pub struct FakeCamera {
    starts: AtomicUsize,
    fail_next: AtomicBool,
    terminations: Arc<AtomicUsize>,
    frame: Mutex<Option<Bytes>>,
    live: Mutex<Option<Live>>,
}

impl FakeCamera {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// 之后每次启动都以 50ms 间隔循环输出这一帧 (包在 multipart 头里)
    pub fn feed_frames(&self, jpeg: Vec<u8>) {
        let mut part = b"--boundarydonotcross\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        part.extend_from_slice(&jpeg);
        part.extend_from_slice(b"\r\n");
        *self.frame.lock().unwrap() = Some(Bytes::from(part));
    }

    pub async fn emit(&self, chunk: &'static [u8]) {
        let tx = self.live.lock().unwrap().as_ref().map(|l| l.tx.clone());
        if let Some(tx) = tx {
            tx.send(Bytes::from_static(chunk))
                .await
                .expect("upstream should be open");
        }
    }

    /// 模拟进程意外退出
    pub async fn crash(&self, reason: &str) {
        let crash = self
            .live
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|l| l.crash.take());
        if let Some(crash) = crash {
            let _ = crash.send(reason.to_string());
        }
        tokio::task::yield_now().await;
    }

    /// 被主动终止的进程数
    pub async fn terminations(&self) -> usize {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraBackend for FakeCamera {
    async fn start(&self) -> Result<Upstream, CameraError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CameraError::ProcessStart("fake start failure".to_string()));
        }

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let (process, crash) = ProcessHandle::simulated();

        let mut exit = process.exit_signal();
        let terminations = self.terminations.clone();
        tokio::spawn(async move {
            if exit.wait().await == "terminated" {
                terminations.fetch_add(1, Ordering::SeqCst);
            }
        });

        let frame = self.frame.lock().unwrap().clone();
        if let Some(frame) = frame {
            let tx = tx.clone();
            tokio::spawn(async move {
                while tx.send(frame.clone()).await.is_ok() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });
        }

        *self.live.lock().unwrap() = Some(Live {
            tx,
            crash: Some(crash),
        });

        Ok(Upstream {
            stream: ReceiverStream::new(rx).map(Ok).boxed(),
            process,
        })
    }
}

/// 记录写入的对象存储
pub struct FakeStore {
    bucket: String,
    writes: Mutex<Vec<(String, Vec<u8>, String)>>,
    public: Mutex<Vec<String>>,
    fail_next: AtomicBool,
    hold: AtomicBool,
    gate: Semaphore,
    entered: Notify,
}

impl FakeStore {
    pub fn new(bucket: &str) -> Arc<Self> {
        Arc::new(Self {
            bucket: bucket.to_string(),
            writes: Mutex::new(Vec::new()),
            public: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            gate: Semaphore::new(0),
            entered: Notify::new(),
        })
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>, String)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn public_paths(&self) -> Vec<String> {
        self.public.lock().unwrap().clone()
    }

    pub fn fail_next_upload(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// 上传在 `release_uploads` 之前挂起
    pub fn hold_uploads(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_uploads(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub async fn wait_for_pending_upload(&self) {
        self.entered.notified().await;
    }

    pub async fn wait_for_writes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while self.writes.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("writes should arrive");
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn write(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), CameraError> {
        self.entered.notify_one();
        if self.hold.load(Ordering::SeqCst) {
            let _permit = self.gate.acquire().await.expect("gate open");
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CameraError::Upload("fake upload failure".to_string()));
        }
        self.writes
            .lock()
            .unwrap()
            .push((path.to_string(), data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn make_public(&self, path: &str) -> Result<(), CameraError> {
        self.public.lock().unwrap().push(path.to_string());
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("https://storage.googleapis.com/{}/{}", self.bucket, path)
    }
}

/// 记录脉冲的门引脚
#[derive(Default)]
pub struct FakePin {
    pulses: Mutex<Vec<Duration>>,
    fail_next: AtomicBool,
    high: AtomicUsize,
    max_high: AtomicUsize,
}

impl FakePin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pulses(&self) -> Vec<Duration> {
        self.pulses.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// 同时处于高电平的脉冲数的最大值
    pub fn max_concurrent(&self) -> usize {
        self.max_high.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DoorPin for FakePin {
    async fn pulse(&self, duration: Duration) -> Result<(), CameraError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CameraError::Gpio("fake pin failure".to_string()));
        }
        self.pulses.lock().unwrap().push(duration);
        let high = self.high.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_high.fetch_max(high, Ordering::SeqCst);
        tokio::time::sleep(duration).await;
        self.high.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 记录删除操作的命令源
#[derive(Default)]
pub struct FakeFeed {
    removed: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn fail_removals(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandFeed for FakeFeed {
    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.removed.lock().unwrap().push(key.to_string());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("feed unreachable");
        }
        Ok(())
    }
}
