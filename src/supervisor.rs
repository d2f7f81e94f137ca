use crate::command::{CommandDispatcher, FeedEvent};
use crate::config::RetryPolicy;
use crate::feed::FirebaseFeed;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 启动命令源的后台监护任务
///
/// # 任务流程：
/// - 分发任务按到达顺序逐条处理记录
/// - 连接命令源，断开后按指数退避重连
/// - 连续失败达到上限后放弃
/// - 收到取消信号时退出
pub async fn start_supervisor(
    feed: Arc<FirebaseFeed>,
    dispatcher: Arc<CommandDispatcher>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    let (tx, rx) = mpsc::channel::<FeedEvent>(32);
    let dispatch_task = tokio::spawn(run_dispatcher(dispatcher, rx));

    let mut failures: u32 = 0;
    loop {
        // --- 阶段 1: 监听直到连接结束 ---
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = feed.listen(&tx) => result,
        };

        // --- 阶段 2: 计算退避 ---
        let backoff = match result {
            Ok(()) => {
                failures = 0;
                retry.backoff(0)
            }
            Err(e) => {
                failures += 1;
                if retry.exhausted(failures) {
                    // 达到最大重试次数，放弃
                    error!(
                        "[Feed] Reached max retry attempts ({}). Giving up: {:#}",
                        retry.max_attempts, e
                    );
                    break;
                }
                let backoff = retry.backoff(failures - 1);
                warn!(
                    "[Feed] Connection failed ({}). Retry {}. Backing off for {}s.",
                    e,
                    failures,
                    backoff.as_secs()
                );
                backoff
            }
        };

        // --- 阶段 3: 等待重连 ---
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    drop(tx);
    let _ = dispatch_task.await;
    info!("[Feed] Supervisor stopped.");
}

/// 逐条分发命令
pub async fn run_dispatcher(dispatcher: Arc<CommandDispatcher>, mut rx: mpsc::Receiver<FeedEvent>) {
    while let Some(event) = rx.recv().await {
        let route = dispatcher.dispatch(event).await;
        debug!("[Feed] Routed to {:?}", route);
    }
}
