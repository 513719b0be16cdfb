//! # RequestRecord：在途请求的完成句柄
//!
//! ## 核心意图（Why）
//! - 把“请求已被通道接受”到“调用方拿到结果”之间的状态收敛到一个单次赋值单元中：
//!   响应、失败、取消、超时四条路径竞争同一个槽位，首个写入者胜出；
//! - 通道借助续体（continuation）在完成时归还容量，调用方借助 `await` 获取结果，
//!   二者互不感知。
//!
//! ## 行为契约（What）
//! - [`RequestRecord::complete`] 与 [`RequestRecord::complete_exceptionally`] 至多一次生效，
//!   返回值表示本次调用是否完成了状态跃迁；
//! - [`RequestRecord::on_complete`] 注册的续体恰好执行一次；若记录已完成则立即执行；
//!   续体在内部锁释放后运行，可安全地回调通道；
//! - [`RequestRecord::cancel`] 以 [`TransportError::Cancelled`] 完成记录；`interrupt_send`
//!   决定尚未开始写出的帧是否还要发送（[`RequestRecord::should_write`]）；
//! - 时间线（开始写出、写出进展、写完、读入进展）供通道的挂起检测使用。
//!
//! ## 风险提示（Trade-offs）
//! - 完成槽位使用 `parking_lot::Mutex`，临界区只做指针搬运，不会执行用户代码；
//! - 结果需要克隆给每个等待者，响应负载为 `Bytes`，克隆只增加引用计数。

use std::future::{Future, IntoFuture};
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::address::PhysicalAddress;
use crate::error::TransportError;
use crate::message::{StoreRequest, StoreResponse};

/// 记录的最终结果。
pub type RecordOutcome = Result<StoreResponse, TransportError>;

type Continuation = Box<dyn FnOnce(&RecordOutcome) + Send>;

/// 在途请求的完成句柄，克隆后共享同一个槽位。
#[derive(Clone)]
pub struct RequestRecord {
    inner: Arc<RecordInner>,
}

struct RecordInner {
    correlation_id: u64,
    address: PhysicalAddress,
    request: StoreRequest,
    created_at: Instant,
    deadline: Instant,
    cancelled: AtomicBool,
    interrupt_send: AtomicBool,
    timeline: Mutex<Timeline>,
    slot: Mutex<Slot>,
}

struct Timeline {
    send_started_at: Option<Instant>,
    flushed_at: Option<Instant>,
    last_send_progress_at: Instant,
    last_receive_progress_at: Option<Instant>,
}

#[derive(Default)]
struct Slot {
    outcome: Option<RecordOutcome>,
    continuations: Vec<Continuation>,
    wakers: Vec<Waker>,
}

impl RequestRecord {
    /// 创建记录，截止时间为 `created_at + request_timeout`。
    pub fn new(
        correlation_id: u64,
        address: PhysicalAddress,
        request: StoreRequest,
        request_timeout: Duration,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            inner: Arc::new(RecordInner {
                correlation_id,
                address,
                request,
                created_at,
                deadline: created_at + request_timeout,
                cancelled: AtomicBool::new(false),
                interrupt_send: AtomicBool::new(false),
                timeline: Mutex::new(Timeline {
                    send_started_at: None,
                    flushed_at: None,
                    last_send_progress_at: created_at,
                    last_receive_progress_at: None,
                }),
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.inner.correlation_id
    }

    pub fn physical_address(&self) -> &PhysicalAddress {
        &self.inner.address
    }

    pub fn request(&self) -> &StoreRequest {
        &self.inner.request
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// 自创建以来经过的时间。
    pub fn elapsed(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// 以响应完成记录。返回 `true` 表示本次调用完成了跃迁。
    pub fn complete(&self, response: StoreResponse) -> bool {
        self.settle(Ok(response), None)
    }

    /// 以错误完成记录。返回 `true` 表示本次调用完成了跃迁。
    pub fn complete_exceptionally(&self, error: TransportError) -> bool {
        self.settle(Err(error), None)
    }

    /// 取消请求。
    ///
    /// - `interrupt_send = true`：若帧尚未开始写出，写循环将跳过它；
    /// - `interrupt_send = false`：帧照常发出，仅丢弃之后到达的响应。
    ///
    /// 返回 `true` 表示取消生效（记录此前尚未完成）。
    pub fn cancel(&self, interrupt_send: bool) -> bool {
        if self.is_completed() {
            return false;
        }
        let error = TransportError::Cancelled {
            address: self.inner.address.clone(),
            correlation_id: self.inner.correlation_id,
        };
        self.settle(Err(error), Some(interrupt_send))
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.inner.slot.lock().outcome.is_some()
    }

    /// 写循环在写出帧之前调用：已完成的记录不再占用线路，
    /// 唯一的例外是“取消但不打断发送”。
    pub fn should_write(&self) -> bool {
        if !self.is_completed() {
            return true;
        }
        self.is_cancelled() && !self.inner.interrupt_send.load(Ordering::Acquire)
    }

    /// 注册完成续体；若记录已完成则立即在当前线程执行。
    pub fn on_complete<F>(&self, continuation: F)
    where
        F: FnOnce(&RecordOutcome) + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                continuation(&outcome);
            }
            None => slot.continuations.push(Box::new(continuation)),
        }
    }

    /// 非阻塞地读取结果。
    pub fn try_outcome(&self) -> Option<RecordOutcome> {
        self.inner.slot.lock().outcome.clone()
    }

    /// 返回一个等待结果的 Future；等价于 `record.clone().await`。
    pub fn outcome(&self) -> RecordFuture {
        RecordFuture {
            record: self.clone(),
        }
    }

    pub fn mark_send_started(&self, now: Instant) {
        let mut timeline = self.inner.timeline.lock();
        timeline.send_started_at.get_or_insert(now);
        timeline.last_send_progress_at = now;
    }

    pub fn record_send_progress(&self, now: Instant) {
        self.inner.timeline.lock().last_send_progress_at = now;
    }

    pub fn mark_flushed(&self, now: Instant) {
        let mut timeline = self.inner.timeline.lock();
        timeline.flushed_at.get_or_insert(now);
        timeline.last_send_progress_at = now;
    }

    pub fn record_receive_progress(&self, now: Instant) {
        self.inner.timeline.lock().last_receive_progress_at = Some(now);
    }

    pub fn send_started_at(&self) -> Option<Instant> {
        self.inner.timeline.lock().send_started_at
    }

    pub fn flushed_at(&self) -> Option<Instant> {
        self.inner.timeline.lock().flushed_at
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed_at().is_some()
    }

    pub fn last_send_progress_at(&self) -> Instant {
        self.inner.timeline.lock().last_send_progress_at
    }

    pub fn last_receive_progress_at(&self) -> Option<Instant> {
        self.inner.timeline.lock().last_receive_progress_at
    }

    /// 写入结果槽位。`cancel` 携带 `interrupt_send`：取消标志与结果在同一临界区内发布，
    /// 观察到“已完成”的线程必然同时观察到取消标志。
    fn settle(&self, outcome: RecordOutcome, cancel: Option<bool>) -> bool {
        let (continuations, wakers) = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            if let Some(interrupt_send) = cancel {
                self.inner
                    .interrupt_send
                    .store(interrupt_send, Ordering::Release);
                self.inner.cancelled.store(true, Ordering::Release);
            }
            slot.outcome = Some(outcome.clone());
            (
                mem::take(&mut slot.continuations),
                mem::take(&mut slot.wakers),
            )
        };
        for continuation in continuations {
            continuation(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("correlation_id", &self.inner.correlation_id)
            .field("address", &self.inner.address)
            .field("completed", &self.is_completed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// 等待记录完成的 Future。
///
/// - **契约 (What)**：多次轮询只登记一次等价的唤醒器；丢弃 Future 不会取消请求，
///   取消需要显式调用 [`RequestRecord::cancel`]。
pub struct RecordFuture {
    record: RequestRecord,
}

impl Future for RecordFuture {
    type Output = RecordOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.record.inner.slot.lock();
        if let Some(outcome) = slot.outcome.as_ref() {
            return Poll::Ready(outcome.clone());
        }
        if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl IntoFuture for RequestRecord {
    type Output = RecordOutcome;
    type IntoFuture = RecordFuture;

    fn into_future(self) -> Self::IntoFuture {
        RecordFuture { record: self }
    }
}
