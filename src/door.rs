use crate::error::CameraError;
use crate::gpio::DoorPin;
use crate::snapshot::SnapshotCoordinator;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

struct SettleTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    pending: Option<SettleTimer>,
    next_id: u64,
}

/// 门控制器
///
/// 每次触发先发出继电器脉冲，再安排一次 "门已到位" 的快照；
/// 在快照触发前再次触发会取消旧定时器，只保留最新的一次。
pub struct DoorController {
    pin: Arc<dyn DoorPin>,
    snapshots: SnapshotCoordinator,
    pulse: Duration,
    settle_delay: Duration,
    /// 同一时刻只允许一个脉冲
    actuating: tokio::sync::Mutex<()>,
    timer: Arc<Mutex<TimerSlot>>,
}

impl DoorController {
    pub fn new(
        pin: Arc<dyn DoorPin>,
        snapshots: SnapshotCoordinator,
        pulse: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            pin,
            snapshots,
            pulse,
            settle_delay,
            actuating: tokio::sync::Mutex::new(()),
            timer: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    /// 触发门继电器
    ///
    /// # 错误处理
    /// - 引脚写入失败时直接返回，不安排快照
    pub async fn trigger(&self, action: Option<&str>) -> Result<(), CameraError> {
        info!("Door triggered (action: {}).", action.unwrap_or("-"));
        {
            let _actuating = self.actuating.lock().await;
            self.pin.pulse(self.pulse).await?;
        }
        self.schedule_settle_snapshot();
        Ok(())
    }

    fn schedule_settle_snapshot(&self) {
        let mut slot = self.timer.lock().unwrap();
        if let Some(old) = slot.pending.take() {
            old.handle.abort();
            info!("Settle snapshot #{} superseded.", old.id);
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let delay = self.settle_delay;
        let timer = self.timer.clone();
        let snapshots = self.snapshots.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // 只有仍是最新定时器时才触发
                let mut slot = timer.lock().unwrap();
                match &slot.pending {
                    Some(pending) if pending.id == id => {
                        slot.pending = None;
                    }
                    _ => return,
                }
            }

            info!("Door settled, taking snapshot.");
            match snapshots.capture().await {
                Ok(url) => info!("Door snapshot: {}", url),
                Err(e) => error!("Door snapshot failed: {}", e),
            }
        });

        slot.pending = Some(SettleTimer { id, handle });
        info!(
            "Settle snapshot #{} scheduled in {}s.",
            id,
            delay.as_secs()
        );
    }

    pub fn has_pending_snapshot(&self) -> bool {
        self.timer.lock().unwrap().pending.is_some()
    }

    /// 取消待执行的快照
    pub fn shutdown(&self) {
        if let Some(pending) = self.timer.lock().unwrap().pending.take() {
            pending.handle.abort();
        }
    }
}
