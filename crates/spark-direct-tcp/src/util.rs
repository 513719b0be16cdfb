use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use spark_direct_core::{PhysicalAddress, TransportError};
use tokio::sync::watch;

use crate::error::{OperationKind, cancelled_error, timeout_error};

/// 一次性的关闭信号，所有后台任务在 `select!` 中优先监听它。
#[derive(Clone, Debug)]
pub(crate) struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// 统计仍在运行的后台任务，供关闭流程等待 IO 拆除。
#[derive(Clone, Debug)]
pub(crate) struct TaskGauge {
    tx: Arc<watch::Sender<usize>>,
}

/// 任务存活凭证，析构即登记退出。
#[derive(Debug)]
pub(crate) struct TaskGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl TaskGauge {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// 必须在 `spawn` 之前同步调用，避免等待方观察到“零任务”的假象。
    pub(crate) fn enter(&self) -> TaskGuard {
        self.tx.send_modify(|running| *running += 1);
        TaskGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        *self.tx.borrow()
    }

    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|running| *running == 0).await;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tx
            .send_modify(|running| *running = running.saturating_sub(1));
    }
}

/// 在关闭信号与时间预算的约束下执行建连类 Future。
///
/// # 教案式说明
/// - **契约 (What)**：关闭信号优先于超时，超时优先于结果；
///   关闭返回 `ChannelClosed`，超时返回 `ConnectionFailed(TimedOut)`；
/// - **风险 (Trade-offs)**：被放弃的 Future 在 `select!` 结束时析构，
///   半完成的 TCP/TLS 握手随之释放。
pub(crate) async fn run_with_deadline<F, T>(
    kind: OperationKind,
    address: &PhysicalAddress,
    budget: Duration,
    shutdown: &ShutdownSignal,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    if shutdown.is_triggered() {
        return Err(cancelled_error(kind, address));
    }
    let cancel = shutdown.wait();
    let sleep = tokio::time::sleep(budget);
    tokio::pin!(cancel);
    tokio::pin!(sleep);
    tokio::pin!(future);

    tokio::select! {
        biased;
        _ = &mut cancel => Err(cancelled_error(kind, address)),
        _ = &mut sleep => Err(timeout_error(kind, address, budget)),
        result = &mut future => result,
    }
}
