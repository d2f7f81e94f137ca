use crate::broker::ResourceBroker;
use crate::error::CameraError;
use crate::jpeg::FrameExtractor;
use crate::storage::ObjectStore;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

type Outcome = Option<Result<String, CameraError>>;

/// 进行中的一次快照，等待者共享同一个结果
struct Ticket {
    id: u64,
    outcome: watch::Receiver<Outcome>,
}

struct SnapshotInner {
    broker: ResourceBroker,
    store: Arc<dyn ObjectStore>,
    object_path: String,
    capture_timeout: Duration,
    upload_timeout: Duration,
    in_flight: Mutex<Option<Ticket>>,
    next_ticket: Mutex<u64>,
}

/// 快照单飞协调器
///
/// 同一时刻最多一次 抓帧 + 上传；进行中再次请求的调用者
/// 挂到当前票据上，拿到同一个 URL 或同一个错误。
#[derive(Clone)]
pub struct SnapshotCoordinator {
    inner: Arc<SnapshotInner>,
}

impl SnapshotCoordinator {
    pub fn new(
        broker: ResourceBroker,
        store: Arc<dyn ObjectStore>,
        object_path: impl Into<String>,
        capture_timeout: Duration,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                broker,
                store,
                object_path: object_path.into(),
                capture_timeout,
                upload_timeout,
                in_flight: Mutex::new(None),
                next_ticket: Mutex::new(0),
            }),
        }
    }

    /// 快照的固定公开地址，上传前即可得知
    pub fn public_url(&self) -> String {
        self.inner.store.public_url(&self.inner.object_path)
    }

    /// 抓拍并上传，返回公开地址
    pub async fn capture(&self) -> Result<String, CameraError> {
        let mut outcome = self.join_or_start();
        let result = match outcome.wait_for(|o| o.is_some()).await {
            Ok(result) => result.clone(),
            Err(_) => Some(Err(CameraError::Upload("snapshot task aborted".to_string()))),
        };
        result.unwrap_or(Err(CameraError::StreamEnded))
    }

    fn join_or_start(&self) -> watch::Receiver<Outcome> {
        let mut slot = self.inner.in_flight.lock().unwrap();
        if let Some(ticket) = slot.as_ref() {
            info!("Snapshot #{} already in flight, waiting for it.", ticket.id);
            return ticket.outcome.clone();
        }

        let id = {
            let mut next = self.inner.next_ticket.lock().unwrap();
            *next += 1;
            *next
        };
        let (tx, rx) = watch::channel(None);
        *slot = Some(Ticket {
            id,
            outcome: rx.clone(),
        });

        // 独立任务执行，调用者放弃等待也不会卡住票据
        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!("Snapshot #{} started.", id);
            let result = inner.run().await;
            match &result {
                Ok(url) => info!("Snapshot #{} available at {}", id, url),
                Err(e) => error!("Snapshot #{} failed: {}", id, e),
            }

            // 先清空票据再发布结果，之后的请求会开始新的快照
            inner.in_flight.lock().unwrap().take();
            let _ = tx.send(Some(result));
        });
        rx
    }

    pub fn in_flight(&self) -> bool {
        self.inner.in_flight.lock().unwrap().is_some()
    }
}

impl SnapshotInner {
    async fn run(&self) -> Result<String, CameraError> {
        let frame = self.grab_frame().await?;

        // 上传与公开共用一个时限，超时后票据照常清空
        let upload = async {
            self.store
                .write(&self.object_path, frame, "image/jpeg")
                .await?;
            self.store.make_public(&self.object_path).await
        };
        match tokio::time::timeout(self.upload_timeout, upload).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CameraError::Upload(format!(
                    "timed out after {}s",
                    self.upload_timeout.as_secs()
                )))
            }
        }
        Ok(self.store.public_url(&self.object_path))
    }

    /// 从共享流中读出一帧完整 JPEG，消费者在返回时归还
    async fn grab_frame(&self) -> Result<Bytes, CameraError> {
        let mut consumer = self.broker.acquire().await?;
        let mut extractor = FrameExtractor::new();

        let read = async {
            while let Some(chunk) = consumer.next_chunk().await {
                if let Some(frame) = extractor.push(&chunk?) {
                    return Ok(Bytes::from(frame));
                }
            }
            Err(CameraError::StreamEnded)
        };

        let result = match tokio::time::timeout(self.capture_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(CameraError::CaptureTimeout(self.capture_timeout.as_secs())),
        };
        consumer.close();
        result
    }
}
