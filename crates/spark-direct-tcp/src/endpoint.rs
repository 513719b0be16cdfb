//! # Endpoint：单个副本上的通道集合
//!
//! ## 意图（Why）
//! - 一个副本可能需要多条连接才能承载并发；端点负责在通道之间做最少负载选择，
//!   并在现有通道都满时按需扩容，直到 `max_channels_per_endpoint`；
//! - 通道退役（挂起、空闲、失败）后由端点移出集合，之后的请求自然落到新通道上。
//!
//! ## 契约（What）
//! - 读路径（选择通道）基于 `ArcSwap` 快照，无锁；结构变更（新增/移除通道）
//!   由端点级互斥锁串行化，锁内从不调用通道的 `send`/`close`；
//! - 所有通道已满且数量已达上限时返回 `EndpointSaturated`；关闭后返回 `EndpointClosed`；
//! - `close_graceful` 在截止时间内完成：前一半时间等待在途请求，之后强制关闭并等待 IO 拆除。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use spark_direct_core::{
    EndpointSnapshot, Options, PhysicalAddress, RequestRecord, StoreRequest, TransportError,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Retirement};
use crate::connector::Connector;
use crate::progress::ProgressClock;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 选择通道的重试上限：并发竞争同一通道的最后一个容量单位时，换一条再试。
const SELECT_ATTEMPTS: usize = 4;

/// 副本端点句柄，克隆后共享同一组通道。
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    address: PhysicalAddress,
    options: Arc<Options>,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    channels: ArcSwap<Vec<Channel>>,
    structure: Mutex<()>,
    closed: AtomicBool,
    next_channel_id: AtomicU64,
    activity: ProgressClock,
    metrics: EndpointMetrics,
}

#[derive(Debug, Default)]
struct EndpointMetrics {
    requests_accepted: AtomicU64,
    responses: AtomicU64,
    failures: AtomicU64,
    channels_opened: AtomicU64,
    channels_retired: AtomicU64,
    channels_idle_evicted: AtomicU64,
}

impl Endpoint {
    pub(crate) fn new(
        address: PhysicalAddress,
        options: Arc<Options>,
        connector: Arc<dyn Connector>,
        runtime: Handle,
    ) -> Self {
        debug!(address = %address, "endpoint created");
        Self {
            inner: Arc::new(EndpointInner {
                address,
                options,
                connector,
                runtime,
                channels: ArcSwap::from_pointee(Vec::new()),
                structure: Mutex::new(()),
                closed: AtomicBool::new(false),
                next_channel_id: AtomicU64::new(1),
                activity: ProgressClock::new(Instant::now()),
                metrics: EndpointMetrics::default(),
            }),
        }
    }

    pub fn physical_address(&self) -> &PhysicalAddress {
        &self.inner.address
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 两个句柄是否指向同一个端点。
    pub fn ptr_eq(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.load().len()
    }

    /// 当前通道集合的快照。
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.load().iter().cloned().collect()
    }

    /// 所有通道的在途请求总数。
    pub fn outstanding(&self) -> usize {
        self.inner
            .channels
            .load()
            .iter()
            .map(Channel::outstanding)
            .sum()
    }

    /// 在途为零且最近一次活动距今超过 `idle_endpoint_timeout`。
    pub fn is_idle(&self, now: Instant) -> bool {
        self.outstanding() == 0 && self.idle_elapsed(now)
    }

    fn idle_elapsed(&self, now: Instant) -> bool {
        self.inner.activity.idle_for(now) >= self.inner.options.idle_endpoint_timeout()
    }

    /// 空闲驱逐的原子判定：确认空闲并封存端点，成功后调用方负责 [`Endpoint::close_sealed`]。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：在结构锁内逐条通道做空闲占位；任一通道已有在途请求即撤回全部占位并放弃；
    ///   全部占位成功后置位关闭标志；
    /// - **契约 (What)**：与 `send` 的容量预留互斥，要么请求先被登记、端点保留，
    ///   要么封存成功、请求以 `EndpointClosed` 失败后由客户端重新查找。
    pub(crate) fn seal_if_idle(&self, now: Instant) -> bool {
        let inner = &self.inner;
        let _structure = inner.structure.lock();
        if self.is_closed() || !self.idle_elapsed(now) {
            return false;
        }
        let channels = inner.channels.load_full();
        let claimed = channels
            .iter()
            .take_while(|channel| channel.try_claim_idle())
            .count();
        if claimed < channels.len() || inner.closed.swap(true, Ordering::AcqRel) {
            for channel in &channels[..claimed] {
                channel.release_idle_claim();
            }
            return false;
        }
        true
    }

    /// 提交请求。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：
    ///   1. 在快照中选剩余容量最多的可用通道；
    ///   2. 没有可用通道时加锁复查，数量未达上限则新建通道；
    ///   3. 通道在选择与提交之间被占满或关闭时换一条重试；
    /// - **契约 (What)**：成功时记录已被某个通道登记。
    pub fn send(&self, request: StoreRequest) -> Result<RequestRecord, TransportError> {
        let inner = &self.inner;
        for _ in 0..SELECT_ATTEMPTS {
            if self.is_closed() {
                return Err(TransportError::EndpointClosed {
                    address: inner.address.clone(),
                });
            }
            let channel = match self.least_loaded() {
                Some(channel) => channel,
                None => match self.open_channel()? {
                    Some(channel) => channel,
                    None => continue,
                },
            };
            match channel.send(request.clone()) {
                Ok(record) => {
                    self.track(&record);
                    return Ok(record);
                }
                Err(err)
                    if err.is_capacity_exceeded()
                        || matches!(err, TransportError::ChannelClosed { .. }) =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(self.saturated())
    }

    fn least_loaded(&self) -> Option<Channel> {
        self.inner
            .channels
            .load()
            .iter()
            .filter(|channel| channel.headroom() > 0)
            .max_by_key(|channel| channel.headroom())
            .cloned()
    }

    /// 在结构锁内复查并按需新建通道。
    ///
    /// - `Ok(Some)`：新建的通道；
    /// - `Ok(None)`：复查时发现已有可用通道，调用方应重新选择；
    /// - `Err`：端点已关闭或已饱和。
    fn open_channel(&self) -> Result<Option<Channel>, TransportError> {
        let inner = &self.inner;
        let _structure = inner.structure.lock();
        if self.is_closed() {
            return Err(TransportError::EndpointClosed {
                address: inner.address.clone(),
            });
        }
        let current = inner.channels.load_full();
        if current.iter().any(|channel| channel.headroom() > 0) {
            return Ok(None);
        }
        if current.len() >= inner.options.max_channels_per_endpoint() {
            return Err(self.saturated());
        }

        let id = inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(inner);
        let channel = Channel::spawn(
            id,
            inner.address.clone(),
            Arc::clone(&inner.options),
            Arc::clone(&inner.connector),
            &inner.runtime,
            Some(Box::new(move |channel_id: u64, retirement: Retirement| {
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.remove_channel(channel_id, retirement);
                }
            })),
        );
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(channel.clone());
        inner.channels.store(Arc::new(next));
        inner.metrics.channels_opened.fetch_add(1, Ordering::Relaxed);
        debug!(
            address = %inner.address,
            channel_id = id,
            channels = current.len() + 1,
            "channel opened"
        );
        Ok(Some(channel))
    }

    fn track(&self, record: &RequestRecord) {
        let inner = &self.inner;
        inner.activity.touch_activity(record.created_at());
        inner
            .metrics
            .requests_accepted
            .fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(inner);
        record.on_complete(move |outcome| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.activity.touch_activity(Instant::now());
            let counter = match outcome {
                Ok(_) => &inner.metrics.responses,
                Err(_) => &inner.metrics.failures,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn saturated(&self) -> TransportError {
        TransportError::EndpointSaturated {
            address: self.inner.address.clone(),
            channels: self.channel_count(),
            limit_per_channel: self.inner.options.max_requests_per_channel(),
        }
    }

    /// 立即关闭：所有通道强制关闭，在途请求以 `ChannelClosed` 完成。
    ///
    /// 返回被关闭的通道，供调用方等待 IO 拆除；重复调用返回空集合。
    pub fn close(&self) -> Vec<Channel> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.close_detached("endpoint closed")
    }

    /// 拆除已被 [`Endpoint::seal_if_idle`] 封存的端点。
    pub(crate) fn close_sealed(&self) -> Vec<Channel> {
        self.close_detached("idle endpoint evicted")
    }

    fn close_detached(&self, reason: &'static str) -> Vec<Channel> {
        let channels = self.detach_channels();
        for channel in &channels {
            channel.close(reason);
        }
        debug!(address = %self.inner.address, channels = channels.len(), reason, "endpoint closed");
        channels
    }

    /// 有界的优雅关闭。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：
    ///   1. 所有通道进入 `Draining`，不再接受新请求；
    ///   2. 在前一半时间预算内等待在途请求自然完成；
    ///   3. 强制关闭剩余通道，在截止时间前等待 IO 任务退出；
    /// - **风险 (Trade-offs)**：截止时间后仍未退出的任务被放弃，只记录 `warn` 日志。
    pub async fn close_graceful(&self, deadline: Instant) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels = self.detach_channels();
        for channel in &channels {
            channel.drain();
        }

        let now = Instant::now();
        let drain_until = now + deadline.saturating_duration_since(now) / 2;
        while channels.iter().any(|channel| channel.outstanding() > 0)
            && Instant::now() < drain_until
        {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        for channel in &channels {
            channel.close("endpoint shutting down");
        }
        let budget = deadline.saturating_duration_since(Instant::now());
        let results = join_all(channels.iter().map(|channel| channel.wait_closed(budget))).await;
        let abandoned = results.iter().filter(|finished| !**finished).count();
        if abandoned > 0 {
            warn!(
                address = %self.inner.address,
                abandoned,
                "channel teardown exceeded shutdown deadline, abandoning"
            );
        }
        debug!(address = %self.inner.address, channels = channels.len(), "endpoint closed");
    }

    fn detach_channels(&self) -> Vec<Channel> {
        let _structure = self.inner.structure.lock();
        let channels = self.inner.channels.swap(Arc::new(Vec::new()));
        channels.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let inner = &self.inner;
        let metrics = &inner.metrics;
        let channels = inner.channels.load();
        EndpointSnapshot {
            address: inner.address.clone(),
            closed: self.is_closed(),
            outstanding: channels.iter().map(Channel::outstanding).sum(),
            requests_accepted: metrics.requests_accepted.load(Ordering::Relaxed),
            responses: metrics.responses.load(Ordering::Relaxed),
            failures: metrics.failures.load(Ordering::Relaxed),
            channels_opened: metrics.channels_opened.load(Ordering::Relaxed),
            channels_retired: metrics.channels_retired.load(Ordering::Relaxed),
            channels_idle_evicted: metrics.channels_idle_evicted.load(Ordering::Relaxed),
            idle_for_ms: inner.activity.idle_for(Instant::now()).as_millis() as u64,
            channels: channels.iter().map(Channel::snapshot).collect(),
        }
    }
}

impl EndpointInner {
    /// 通道退役回调：移出集合并更新指标。
    fn remove_channel(&self, channel_id: u64, retirement: Retirement) {
        {
            let _structure = self.structure.lock();
            let current = self.channels.load_full();
            if current.iter().any(|channel| channel.id() == channel_id) {
                let next: Vec<Channel> = current
                    .iter()
                    .filter(|channel| channel.id() != channel_id)
                    .cloned()
                    .collect();
                self.channels.store(Arc::new(next));
            }
        }
        match retirement {
            Retirement::Idle => {
                self.metrics
                    .channels_idle_evicted
                    .fetch_add(1, Ordering::Relaxed);
                info!(address = %self.address, channel_id, "idle channel evicted");
            }
            Retirement::Hang | Retirement::Failed => {
                self.metrics
                    .channels_retired
                    .fetch_add(1, Ordering::Relaxed);
            }
            Retirement::Closed => {}
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.inner.address)
            .field("channels", &self.channel_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
