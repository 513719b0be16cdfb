//! # Channel：一条长连接上的请求复用
//!
//! ## 意图（Why）
//! - 一条 TCP（或 TLS）连接同时承载至多 `max_requests_per_channel` 个在途请求，
//!   响应按关联 ID 分发，与提交顺序无关；
//! - `send` 对调用方完全非阻塞：容量预留、记录登记与入队都在当前线程完成，
//!   建连与写出交给后台写任务。
//!
//! ## 契约（What）
//! - 状态机：`Connecting → Open → Draining → Closed`，挂起或显式关闭时 `Open → Closed`，
//!   建连失败时 `Connecting → Closed`；
//! - 容量先原子预留再登记记录，记录完成时经续体恰好归还一次；
//! - `close` 幂等，可与 `send` 并发；关闭后所有在途记录以 `ChannelClosed` 完成。
//!
//! ## 风险（Trade-offs）
//! - 在途表使用 `DashMap`，完成续体会回写同一张表，
//!   因此任何持有分片守卫的代码都不能在守卫存活期间完成记录。

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use spark_direct_core::{
    ChannelSnapshot, ChannelState, Frame, FrameError, Options, PhysicalAddress, RequestRecord,
    StoreRequest, TimeoutCause, TransportError,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, warn};

use crate::connector::Connector;
use crate::io::{self, PendingWrite};
use crate::progress::ProgressClock;
use crate::timer;
use crate::util::{ShutdownSignal, TaskGauge};

/// 通道退出的原因，端点据此维护指标。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Retirement {
    /// 显式关闭或端点关闭。
    Closed,
    /// 空闲驱逐。
    Idle,
    /// 挂起检测触发。
    Hang,
    /// 建连失败、IO 失败或协议错误。
    Failed,
}

pub(crate) type RetireHook = Box<dyn Fn(u64, Retirement) + Send + Sync>;

/// 空闲占位：`reserved` 取该值时任何容量预留都会失败，通道随后被关闭。
const IDLE_CLAIM: usize = usize::MAX;

/// 多路复用通道的句柄，克隆后共享同一条连接。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    pub(crate) id: u64,
    pub(crate) address: PhysicalAddress,
    pub(crate) options: Arc<Options>,
    state: AtomicU8,
    healthy: AtomicBool,
    pub(crate) outstanding: DashMap<u64, RequestRecord>,
    reserved: AtomicUsize,
    next_correlation_id: AtomicU64,
    pub(crate) requests_sent: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) bytes_read: AtomicU64,
    pub(crate) progress: ProgressClock,
    queue: Mutex<Option<mpsc::UnboundedSender<PendingWrite>>>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) tasks: TaskGauge,
    retire_hook: Mutex<Option<RetireHook>>,
}

impl Channel {
    /// 在当前 Tokio 运行时上打开一条通道。
    ///
    /// 返回时通道处于 `Connecting`，请求可以立即提交，写任务建连成功后依次写出。
    pub fn open(
        id: u64,
        address: PhysicalAddress,
        options: Arc<Options>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|err| TransportError::RuntimeUnavailable {
            detail: err.to_string(),
        })?;
        Ok(Self::spawn(id, address, options, connector, &runtime, None))
    }

    pub(crate) fn spawn(
        id: u64,
        address: PhysicalAddress,
        options: Arc<Options>,
        connector: Arc<dyn Connector>,
        runtime: &Handle,
        retire_hook: Option<RetireHook>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            id,
            address,
            options,
            state: AtomicU8::new(ChannelState::Connecting.to_u8()),
            healthy: AtomicBool::new(true),
            outstanding: DashMap::new(),
            reserved: AtomicUsize::new(0),
            next_correlation_id: AtomicU64::new(1),
            requests_sent: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            progress: ProgressClock::new(Instant::now()),
            queue: Mutex::new(Some(tx)),
            shutdown: ShutdownSignal::new(),
            tasks: TaskGauge::new(),
            retire_hook: Mutex::new(retire_hook),
        });

        let span = tracing::debug_span!(
            "direct_channel",
            address = %inner.address,
            channel_id = inner.id,
            user_agent = inner.options.user_agent(),
        );
        let writer_guard = inner.tasks.enter();
        runtime.spawn(
            io::run_writer(
                Arc::clone(&inner),
                connector,
                rx,
                runtime.clone(),
                writer_guard,
            )
            .instrument(span.clone()),
        );
        let timer_guard = inner.tasks.enter();
        runtime.spawn(timer::run_timer(Arc::clone(&inner), timer_guard).instrument(span));

        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn physical_address(&self) -> &PhysicalAddress {
        &self.inner.address
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// 挂起检测触发后通道被标记为不健康。
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// 当前在途（已预留容量）的请求数。
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding_count()
    }

    /// 剩余容量；不再接受请求或已被空闲占位的通道返回 0。
    pub fn headroom(&self) -> usize {
        if !self.state().accepts_requests() || self.inner.is_idle_claimed() {
            return 0;
        }
        self.inner
            .options
            .max_requests_per_channel()
            .saturating_sub(self.outstanding())
    }

    pub(crate) fn try_claim_idle(&self) -> bool {
        self.inner.try_claim_idle()
    }

    pub(crate) fn release_idle_claim(&self) {
        self.inner.release_idle_claim();
    }

    /// 提交请求。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 通道不再接受请求时返回 `ChannelClosed`；
    ///   - 在途数已达上限时返回 `CapacityExceeded`，不会覆盖已有记录；
    ///   - 请求帧超过 `max_buffer_capacity` 时返回 `FrameTooLarge`；
    ///   - 成功时返回已登记的记录，结果经由记录交付；
    /// - **逻辑 (How)**：先编码（失败不占容量），再 CAS 预留容量，登记记录并挂上归还续体，
    ///   最后复查状态以覆盖与 `close` 的竞争，然后入队。
    pub fn send(&self, request: StoreRequest) -> Result<RequestRecord, TransportError> {
        let inner = &self.inner;
        if !inner.state().accepts_requests() {
            return Err(inner.closed_error("channel is not accepting requests"));
        }

        let max = inner.options.max_buffer_capacity();
        let correlation_id = inner.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(correlation_id, request.payload().clone())
            .to_bytes(max)
            .map_err(|err| match err {
                FrameError::PayloadTooLarge { length, max } => TransportError::FrameTooLarge {
                    address: inner.address.clone(),
                    length,
                    max,
                },
                other => TransportError::Decode {
                    address: inner.address.clone(),
                    correlation_id: Some(correlation_id),
                    detail: other.to_string(),
                },
            })?;

        let limit = inner.options.max_requests_per_channel();
        if inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_err()
        {
            return Err(TransportError::CapacityExceeded {
                address: inner.address.clone(),
                limit,
            });
        }

        let record = RequestRecord::new(
            correlation_id,
            inner.address.clone(),
            request,
            inner.options.request_timeout(),
        );
        inner.progress.touch_activity(record.created_at());
        inner.outstanding.insert(correlation_id, record.clone());
        let weak = Arc::downgrade(inner);
        record.on_complete(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.release(correlation_id);
            }
        });

        if !inner.state().accepts_requests() {
            let error = inner.closed_error("channel closed while accepting request");
            record.complete_exceptionally(error.clone());
            return Err(error);
        }

        let queued = inner
            .queue
            .lock()
            .as_ref()
            .map(|queue| {
                queue
                    .send(PendingWrite {
                        record: record.clone(),
                        frame,
                    })
                    .is_ok()
            })
            .unwrap_or(false);
        if !queued {
            let error = inner.closed_error("channel writer has stopped");
            record.complete_exceptionally(error.clone());
            return Err(error);
        }
        Ok(record)
    }

    /// 停止接受新请求，在途请求继续完成；在途归零后自动关闭。
    ///
    /// 进入 `Draining` 后计时器不再让请求超时，仍未完成的请求在 `close` 时以
    /// `ChannelClosed` 结束。
    pub fn drain(&self) -> bool {
        let drained = self.inner.transition_to_draining();
        if drained && self.outstanding() == 0 {
            self.inner
                .close(Cow::Borrowed("channel drained"), Retirement::Closed);
        }
        drained
    }

    /// 关闭通道；返回 `true` 表示本次调用完成了关闭。
    pub fn close(&self, reason: impl Into<Cow<'static, str>>) -> bool {
        self.inner.close(reason.into(), Retirement::Closed)
    }

    /// 等待后台 IO 任务退出，超时返回 `false`。
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.tasks.wait_idle())
            .await
            .is_ok()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let inner = &self.inner;
        ChannelSnapshot {
            id: inner.id,
            state: inner.state(),
            healthy: self.is_healthy(),
            outstanding: self.outstanding(),
            requests_sent: inner.requests_sent.load(Ordering::Relaxed),
            bytes_written: inner.bytes_written.load(Ordering::Relaxed),
            bytes_read: inner.bytes_read.load(Ordering::Relaxed),
            idle_for_ms: inner.progress.idle_for(Instant::now()).as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl ChannelInner {
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn outstanding_count(&self) -> usize {
        match self.reserved.load(Ordering::Acquire) {
            IDLE_CLAIM => 0,
            reserved => reserved,
        }
    }

    fn is_idle_claimed(&self) -> bool {
        self.reserved.load(Ordering::Acquire) == IDLE_CLAIM
    }

    /// 在途为零时把容量计数原子地置为空闲占位。
    ///
    /// 与 `send` 的 CAS 预留竞争同一个计数：占位成功后预留必然失败，
    /// 预留先成功则占位失败。
    pub(crate) fn try_claim_idle(&self) -> bool {
        self.reserved
            .compare_exchange(0, IDLE_CLAIM, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 撤回空闲占位，通道恢复接受请求。
    pub(crate) fn release_idle_claim(&self) {
        let _ = self.reserved.compare_exchange(
            IDLE_CLAIM,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn closed_error(&self, reason: &'static str) -> TransportError {
        TransportError::channel_closed(self.address.clone(), reason)
    }

    /// 建连成功：`Connecting → Open`。若期间已进入 `Draining` 则保持；已关闭返回 `false`。
    pub(crate) fn mark_open(&self) -> bool {
        let _ = self.state.compare_exchange(
            ChannelState::Connecting.to_u8(),
            ChannelState::Open.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let state = self.state();
        if state != ChannelState::Closed {
            debug!(state = state.as_str(), "channel connected");
        }
        state != ChannelState::Closed
    }

    fn transition_to_draining(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !ChannelState::from_u8(current).accepts_requests() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ChannelState::Draining.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 记录完成续体：移出在途表并归还一个容量单位。
    fn release(&self, correlation_id: u64) {
        if self.outstanding.remove(&correlation_id).is_none() {
            return;
        }
        let remaining = self.reserved.fetch_sub(1, Ordering::AcqRel) - 1;
        self.progress.touch_activity(Instant::now());
        if remaining == 0 && self.state() == ChannelState::Draining {
            self.close(Cow::Borrowed("channel drained"), Retirement::Closed);
        }
    }

    /// 取出在途记录的快照，不持有任何分片守卫。
    pub(crate) fn outstanding_records(&self) -> Vec<RequestRecord> {
        self.outstanding
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn record(&self, correlation_id: u64) -> Option<RequestRecord> {
        self.outstanding
            .get(&correlation_id)
            .map(|entry| entry.value().clone())
    }

    /// 建连失败：通道直接进入 `Closed`，排队的请求以建连错误完成。
    pub(crate) fn fail_connect(&self, error: TransportError) {
        let previous = self
            .state
            .swap(ChannelState::Closed.to_u8(), Ordering::AcqRel);
        if previous == ChannelState::Closed.to_u8() {
            return;
        }
        debug!(code = error.code(), error = %error, "channel connect failed");
        self.shutdown.trigger();
        self.queue.lock().take();
        for record in self.outstanding_records() {
            record.complete_exceptionally(error.clone());
        }
        self.retire(Retirement::Failed);
    }

    /// 挂起检测触发：标记不健康并退役。
    pub(crate) fn retire_hung(&self, cause: TimeoutCause) {
        self.healthy.store(false, Ordering::Release);
        warn!(
            cause = cause.as_str(),
            outstanding = self.outstanding_count(),
            "hang detected, retiring channel"
        );
        self.close(
            Cow::Owned(format!("{cause} detected on connection")),
            Retirement::Hang,
        );
    }

    pub(crate) fn close(&self, reason: Cow<'static, str>, retirement: Retirement) -> bool {
        let previous = self
            .state
            .swap(ChannelState::Closed.to_u8(), Ordering::AcqRel);
        if previous == ChannelState::Closed.to_u8() {
            return false;
        }
        match retirement {
            Retirement::Idle => info!(reason = %reason, "closing idle channel"),
            Retirement::Failed => info!(reason = %reason, "channel failed"),
            Retirement::Closed | Retirement::Hang => debug!(reason = %reason, "channel closed"),
        }
        self.shutdown.trigger();
        self.queue.lock().take();
        let error = TransportError::channel_closed(self.address.clone(), reason);
        for record in self.outstanding_records() {
            record.complete_exceptionally(error.clone());
        }
        self.retire(retirement);
        true
    }

    fn retire(&self, retirement: Retirement) {
        let hook = self.retire_hook.lock().take();
        if let Some(hook) = hook {
            hook(self.id, retirement);
        }
    }
}
