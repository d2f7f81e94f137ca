use crate::camera::CameraBackend;
use crate::error::CameraError;
use crate::mux::{SinkReceiver, StreamMultiplexer};
use crate::process::ProcessHandle;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 摄像头进程的生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    StoppingScheduled,
}

/// 一次启动周期内的运行时资源
struct Activation {
    generation: u64,
    process: ProcessHandle,
    mux: Arc<StreamMultiplexer>,
}

struct StopTimer {
    id: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

struct BrokerState {
    ref_count: usize,
    phase: ProcessState,
    generation: u64,
    starts: u64,
    active: Option<Activation>,
    stop_timer: Option<StopTimer>,
    next_timer_id: u64,
}

impl BrokerState {
    fn cancel_stop(&mut self) {
        if let Some(timer) = self.stop_timer.take() {
            timer.handle.abort();
            if self.active.is_some() {
                self.phase = ProcessState::Running;
            }
            info!("Pending camera stop cancelled.");
        }
    }

    /// 取出当前运行资源并终止进程
    ///
    /// 引用计数只统计当前启动周期的消费者，旧消费者之后的归还被忽略。
    fn teardown(&mut self, reason: CameraError) {
        self.cancel_stop();
        if let Some(mut active) = self.active.take() {
            active.mux.shutdown(reason);
            active.process.terminate();
        }
        self.ref_count = 0;
        self.phase = ProcessState::Stopped;
    }
}

/// 摄像头状态快照 (用于状态接口)
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub ref_count: usize,
    pub state: ProcessState,
    pub starts: u64,
    pub consumers: usize,
    pub stop_in_ms: Option<u64>,
}

struct BrokerInner {
    backend: Arc<dyn CameraBackend>,
    idle_grace: Duration,
    sink_buffer: usize,
    /// 串行化冷启动，保证不会同时拉起两个进程
    start_lock: tokio::sync::Mutex<()>,
    state: Mutex<BrokerState>,
}

/// 摄像头资源代理
///
/// 持有唯一的采集进程与其复用器，按消费者引用计数：
/// - 第一个消费者到来时启动进程
/// - 最后一个消费者离开后延迟 `idle_grace` 停止，期间有新消费者则取消
/// - 进程意外退出时通知所有消费者并回到 Stopped
#[derive(Clone)]
pub struct ResourceBroker {
    inner: Arc<BrokerInner>,
}

impl ResourceBroker {
    pub fn new(backend: Arc<dyn CameraBackend>, idle_grace: Duration, sink_buffer: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                backend,
                idle_grace,
                sink_buffer,
                start_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(BrokerState {
                    ref_count: 0,
                    phase: ProcessState::Stopped,
                    generation: 0,
                    starts: 0,
                    active: None,
                    stop_timer: None,
                    next_timer_id: 0,
                }),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap()
    }

    /// 申请一个流消费者
    ///
    /// # 副作用
    /// - 引用计数加一，取消待执行的停止
    /// - 进程未运行时启动进程并等待就绪
    ///
    /// # 错误处理
    /// - 启动失败时不计入引用计数，返回 `ProcessStart`
    pub async fn acquire(&self) -> Result<ConsumerHandle, CameraError> {
        let _starting = self.inner.start_lock.lock().await;

        // 1. 已有进程则登记并复用
        let (mux, generation) = match self.join_running() {
            Some(joined) => joined,
            None => {
                // 2. 冷启动；请求被取消时 guard 把阶段复位
                info!("Starting camera for first consumer.");
                let mut guard = StartGuard {
                    broker: self,
                    armed: true,
                };
                let started = self.inner.backend.start().await;
                guard.armed = false;

                match started {
                    Ok(upstream) => self.activate(upstream.stream, upstream.process),
                    Err(e) => {
                        error!("Camera start failed: {}", e);
                        self.lock_state().phase = ProcessState::Stopped;
                        return Err(e);
                    }
                }
            }
        };

        let sink = mux.add_sink();
        let ref_count = self.lock_state().ref_count;
        info!("Camera consumer {} joined ({} active).", sink.id(), ref_count);

        Ok(ConsumerHandle {
            sink,
            mux,
            generation,
            broker: Arc::downgrade(&self.inner),
            closed: false,
        })
    }

    fn join_running(&self) -> Option<(Arc<StreamMultiplexer>, u64)> {
        let mut state = self.lock_state();
        let joined = match &state.active {
            Some(active) if !active.mux.is_closed() => (active.mux.clone(), active.generation),
            _ => {
                // 上游已断但回调尚未执行：先丢弃旧资源
                if state.active.is_some() {
                    state.teardown(CameraError::StreamEnded);
                }
                state.phase = ProcessState::Starting;
                return None;
            }
        };
        state.ref_count += 1;
        state.cancel_stop();
        Some(joined)
    }

    fn activate(
        &self,
        stream: crate::camera::ByteStream,
        process: ProcessHandle,
    ) -> (Arc<StreamMultiplexer>, u64) {
        let mut state = self.lock_state();
        state.generation += 1;
        state.starts += 1;
        let generation = state.generation;

        let weak = Arc::downgrade(&self.inner);
        let mux = StreamMultiplexer::spawn(
            stream,
            process.exit_signal(),
            self.inner.sink_buffer,
            Box::new(move |reason| {
                if let Some(inner) = weak.upgrade() {
                    ResourceBroker { inner }.on_upstream_closed(generation, reason);
                }
            }),
        );

        state.active = Some(Activation {
            generation,
            process,
            mux: mux.clone(),
        });
        state.phase = ProcessState::Running;
        state.ref_count += 1;
        info!("Camera running (activation #{}).", generation);
        (mux, generation)
    }

    /// 上游异常结束：丢弃本次启动的资源，下一次 acquire 重新启动
    fn on_upstream_closed(&self, generation: u64, reason: CameraError) {
        let mut state = self.lock_state();
        let current = state
            .active
            .as_ref()
            .map(|a| a.generation == generation)
            .unwrap_or(false);
        if !current {
            return;
        }

        warn!(
            "Camera activation #{} lost with {} consumer(s): {}",
            generation, state.ref_count, reason
        );
        state.teardown(reason);
    }

    /// 归还一个消费者 (由 ConsumerHandle 关闭时调用)
    fn release(&self, generation: u64) {
        let mut state = self.lock_state();
        let current = state
            .active
            .as_ref()
            .map(|a| a.generation == generation)
            .unwrap_or(false);
        if !current {
            debug!("Consumer of stopped activation #{} released.", generation);
            return;
        }
        if state.ref_count == 0 {
            warn!("Camera release without matching acquire ignored.");
            return;
        }
        state.ref_count -= 1;
        info!("Camera consumer left ({} active).", state.ref_count);

        if state.ref_count == 0 {
            self.schedule_stop(&mut state);
        }
    }

    /// 安排延迟停止，同一时刻最多一个停止定时器
    fn schedule_stop(&self, state: &mut BrokerState) {
        state.cancel_stop();

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                // 运行时已经关闭，无法延迟，直接停止
                state.teardown(CameraError::StreamEnded);
                return;
            }
        };

        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.idle_grace;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                ResourceBroker { inner }.stop_if_idle(id);
            }
        });

        state.stop_timer = Some(StopTimer {
            id,
            deadline: Instant::now() + grace,
            handle,
        });
        state.phase = ProcessState::StoppingScheduled;
        info!("Camera idle. Stopping in {}s.", grace.as_secs());
    }

    fn stop_if_idle(&self, timer_id: u64) {
        let mut state = self.lock_state();
        let due = state
            .stop_timer
            .as_ref()
            .map(|t| t.id == timer_id)
            .unwrap_or(false);
        if !due || state.ref_count > 0 {
            return;
        }

        // 定时器任务自身正在执行，不能 abort
        state.stop_timer = None;
        state.teardown(CameraError::StreamEnded);
        info!("Camera stopped after idle grace period.");
    }

    /// 立即停止进程，无视引用计数，可重复调用
    pub fn stop_now(&self) {
        let mut state = self.lock_state();
        let was_running = state.active.is_some();
        state.teardown(CameraError::StreamEnded);
        if was_running {
            info!("Camera stopped on request.");
        }
    }

    pub fn status(&self) -> BrokerStatus {
        let state = self.lock_state();
        BrokerStatus {
            ref_count: state.ref_count,
            state: state.phase,
            starts: state.starts,
            consumers: state.active.as_ref().map(|a| a.mux.sink_count()).unwrap_or(0),
            stop_in_ms: state.stop_timer.as_ref().map(|t| {
                t.deadline.saturating_duration_since(Instant::now()).as_millis() as u64
            }),
        }
    }
}

#[cfg(test)]
impl ResourceBroker {
    pub fn is_running(&self) -> bool {
        self.lock_state().active.is_some()
    }
}

/// 冷启动期间被取消时把 Starting 复位为 Stopped
struct StartGuard<'a> {
    broker: &'a ResourceBroker,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.broker.lock_state();
        if state.active.is_none() {
            state.phase = ProcessState::Stopped;
        }
    }
}

/// 一个活跃的流消费者
///
/// 作为 `Stream` 逐块产出 MJPEG 数据；关闭 (或 drop) 时
/// 从复用器注销并恰好归还一次引用计数。
pub struct ConsumerHandle {
    sink: SinkReceiver,
    mux: Arc<StreamMultiplexer>,
    generation: u64,
    broker: Weak<BrokerInner>,
    closed: bool,
}

impl ConsumerHandle {
    pub fn id(&self) -> u64 {
        self.sink.id()
    }

    /// 关闭消费者，可重复调用
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.mux.remove_sink(self.sink.id());
        if let Some(inner) = self.broker.upgrade() {
            ResourceBroker { inner }.release(self.generation);
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, CameraError>> {
        if self.closed {
            return None;
        }
        self.sink.next_chunk().await
    }
}

impl Stream for ConsumerHandle {
    type Item = Result<Bytes, CameraError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(None);
        }
        this.sink.poll_next_chunk(cx)
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.close();
    }
}
