use crate::camera::ByteStream;
use crate::error::CameraError;
use crate::process::ExitSignal;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Fault = Arc<Mutex<Option<CameraError>>>;

struct SinkSlot {
    tx: mpsc::Sender<Bytes>,
    fault: Fault,
}

struct Sinks {
    slots: HashMap<u64, SinkSlot>,
    /// 上游结束后记录原因，之后注册的 sink 立即收到该错误
    closed: Option<CameraError>,
}

/// 上游关闭时的回调，参数为关闭原因
pub type OnClose = Box<dyn FnOnce(CameraError) + Send + 'static>;

/// 把单个上游字节流复制给任意多个 sink
///
/// 每个 sink 有独立的有界缓冲；缓冲写满的 sink 直接断开，
/// 不会阻塞其他 sink。上游结束后复用器终止，不可重启。
pub struct StreamMultiplexer {
    sinks: Arc<Mutex<Sinks>>,
    next_id: AtomicU64,
    buffer: usize,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StreamMultiplexer {
    /// 启动泵任务读取上游，直到上游结束、出错或进程退出
    pub fn spawn(
        upstream: ByteStream,
        exit: ExitSignal,
        buffer: usize,
        on_close: OnClose,
    ) -> Arc<Self> {
        let mux = Arc::new(Self {
            sinks: Arc::new(Mutex::new(Sinks {
                slots: HashMap::new(),
                closed: None,
            })),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            pump: Mutex::new(None),
        });

        let sinks = mux.sinks.clone();
        let handle = tokio::spawn(pump(upstream, exit, sinks, on_close));
        *mux.pump.lock().unwrap() = Some(handle);
        mux
    }

    /// 注册一个新的 sink
    pub fn add_sink(&self) -> SinkReceiver {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let fault: Fault = Arc::new(Mutex::new(None));

        let mut sinks = self.sinks.lock().unwrap();
        if let Some(reason) = &sinks.closed {
            // 已终止：不保留发送端，接收端读到结束后即看到错误
            *fault.lock().unwrap() = Some(reason.clone());
        } else {
            sinks.slots.insert(
                id,
                SinkSlot {
                    tx,
                    fault: fault.clone(),
                },
            );
        }
        debug!("Sink {} registered ({} active)", id, sinks.slots.len());

        SinkReceiver {
            id,
            rx,
            fault,
            fault_reported: false,
        }
    }

    /// 注销 sink，可重复调用
    pub fn remove_sink(&self, id: u64) {
        let mut sinks = self.sinks.lock().unwrap();
        if sinks.slots.remove(&id).is_some() {
            debug!("Sink {} removed ({} active)", id, sinks.slots.len());
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.sinks.lock().unwrap().closed.is_some()
    }

    /// 主动终止：所有 sink 收到 `reason`，泵任务被取消且不触发 on_close
    pub fn shutdown(&self, reason: CameraError) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
        close_all(&self.sinks, reason);
    }
}

async fn pump(mut upstream: ByteStream, mut exit: ExitSignal, sinks: Arc<Mutex<Sinks>>, on_close: OnClose) {
    let reason = loop {
        tokio::select! {
            chunk = upstream.next() => match chunk {
                Some(Ok(bytes)) => deliver(&sinks, bytes),
                Some(Err(e)) => break CameraError::ProcessCrash(format!("upstream read failed: {}", e)),
                None => break CameraError::ProcessCrash("upstream stream ended".to_string()),
            },
            status = exit.wait() => {
                break CameraError::ProcessCrash(status);
            }
        }
    };

    warn!("Camera stream closed: {}", reason);
    close_all(&sinks, reason.clone());
    on_close(reason);
}

/// 把一个数据块复制给所有 sink，缓冲已满的 sink 会被断开
fn deliver(sinks: &Mutex<Sinks>, bytes: Bytes) {
    let mut sinks = sinks.lock().unwrap();
    sinks.slots.retain(|id, slot| match slot.tx.try_send(bytes.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Sink {} cannot keep up, disconnecting", id);
            *slot.fault.lock().unwrap() = Some(CameraError::SinkBackpressure);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    });
}

fn close_all(sinks: &Mutex<Sinks>, reason: CameraError) {
    let mut sinks = sinks.lock().unwrap();
    if sinks.closed.is_some() {
        return;
    }
    for (_, slot) in sinks.slots.drain() {
        *slot.fault.lock().unwrap() = Some(reason.clone());
    }
    info!("Multiplexer terminated: {}", reason);
    sinks.closed = Some(reason);
}

/// sink 的读取端
///
/// 先读完缓冲中的数据，之后若 sink 是因故障被断开则再返回一次错误。
pub struct SinkReceiver {
    id: u64,
    rx: mpsc::Receiver<Bytes>,
    fault: Fault,
    fault_reported: bool,
}

impl SinkReceiver {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn poll_next_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, CameraError>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(None) => {
                if self.fault_reported {
                    return Poll::Ready(None);
                }
                self.fault_reported = true;
                let fault = self.fault.lock().unwrap().take();
                Poll::Ready(fault.map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, CameraError>> {
        std::future::poll_fn(|cx| self.poll_next_chunk(cx)).await
    }
}
