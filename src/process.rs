use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

/// 上游采集进程的句柄
///
/// 子进程交给一个后台监护任务持有：
/// - `terminate()` 通知监护任务杀掉进程
/// - 进程退出 (无论主动还是意外) 时通过 watch 通道广播退出原因
///
/// 句柄被 drop 等同于 `terminate()`。
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<String>>,
}

impl ProcessHandle {
    /// 接管一个已启动的子进程
    pub fn supervise(mut child: Child) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };

            let reason = match exited {
                Some(Ok(status)) => status.to_string(),
                Some(Err(e)) => format!("wait failed: {}", e),
                None => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill camera process {:?}: {}", pid, e);
                    }
                    info!("Camera process {:?} terminated.", pid);
                    "terminated".to_string()
                }
            };
            let _ = exit_tx.send(Some(reason));
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 请求终止进程，可重复调用
    pub fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// 退出通知的接收端，可交给其他任务监听
    pub fn exit_signal(&self) -> ExitSignal {
        ExitSignal {
            rx: self.exit_rx.clone(),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// 进程退出通知
#[derive(Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<String>>,
}

impl ExitSignal {
    /// 等待进程退出，返回退出原因
    pub async fn wait(&mut self) -> String {
        match self.rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "process monitor gone".to_string(),
        }
    }
}

#[cfg(test)]
impl ProcessHandle {
    /// 不对应真实进程的句柄，测试通过返回的 Sender 模拟进程崩溃
    pub(crate) fn simulated() -> (Self, oneshot::Sender<String>) {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (crash_tx, crash_rx) = oneshot::channel::<String>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let reason = tokio::select! {
                Ok(reason) = crash_rx => reason,
                _ = kill_rx => "terminated".to_string(),
            };
            let _ = exit_tx.send(Some(reason));
        });

        let handle = Self {
            pid: None,
            kill_tx: Some(kill_tx),
            exit_rx,
        };
        (handle, crash_tx)
    }
}
