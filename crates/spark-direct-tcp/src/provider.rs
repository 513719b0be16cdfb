//! # EndpointProvider：按物理地址索引的端点池
//!
//! ## 核心意图（Why）
//! - 为每个副本地址维护唯一的 [`Endpoint`]，同一地址的并发获取只创建一个实例；
//! - 后台清扫长时间空闲的端点，释放其通道与连接。
//!
//! ## 行为契约（What）
//! - `get`：基于 `DashMap` entry API 的单实例创建；关闭后返回 `ProviderClosed`；
//! - `evictions`：单调递增，空闲驱逐与显式驱逐各计一次；
//! - 清扫任务只持有弱引用，端点池析构后自行退出；移除使用 `remove_if`，
//!   端点的封存判定与移除在同一分片锁内完成，读路径不会等待清扫；
//! - 封存与 `send` 的容量预留互斥，已登记的请求不会被清扫打断。
//!
//! ## 风险提示（Trade-offs）
//! - 分片数由 `partition_count` 推导，过小会放大热点分片的锁竞争；
//! - 被驱逐的端点若仍被调用方持有，其 `send` 返回 `EndpointClosed`，由客户端重新查找。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use parking_lot::Mutex;
use spark_direct_core::{EndpointSnapshot, Options, PhysicalAddress, TransportError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::connector::Connector;
use crate::endpoint::Endpoint;

/// 端点池句柄。
#[derive(Clone)]
pub struct EndpointProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    options: Arc<Options>,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    endpoints: DashMap<PhysicalAddress, Endpoint>,
    evictions: AtomicU64,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointProvider {
    /// 创建端点池并在 `runtime` 上启动空闲清扫任务。
    pub fn new(options: Arc<Options>, connector: Arc<dyn Connector>, runtime: Handle) -> Self {
        let shards = options.partition_count().next_power_of_two().max(2);
        let inner = Arc::new(ProviderInner {
            options,
            connector,
            runtime,
            endpoints: DashMap::with_shard_amount(shards),
            evictions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });
        let sweeper = inner
            .runtime
            .spawn(run_sweeper(Arc::downgrade(&inner)));
        *inner.sweeper.lock() = Some(sweeper);
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 获取（必要时创建）地址对应的端点。
    pub fn get(&self, address: &PhysicalAddress) -> Result<Endpoint, TransportError> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(TransportError::ProviderClosed);
        }
        if let Some(endpoint) = inner.endpoints.get(address) {
            return Ok(endpoint.value().clone());
        }

        let endpoint = match inner.endpoints.entry(address.clone()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => vacant
                .insert(Endpoint::new(
                    address.clone(),
                    Arc::clone(&inner.options),
                    Arc::clone(&inner.connector),
                    inner.runtime.clone(),
                ))
                .value()
                .clone(),
        };

        if self.is_closed() {
            inner.endpoints.remove(address);
            endpoint.close();
            return Err(TransportError::ProviderClosed);
        }
        Ok(endpoint)
    }

    /// 当前端点数量。
    pub fn count(&self) -> usize {
        self.inner.endpoints.len()
    }

    /// 累计驱逐次数。
    pub fn evictions(&self) -> u64 {
        self.inner.evictions.load(Ordering::Acquire)
    }

    /// 显式驱逐一个端点；返回 `true` 表示端点存在并已被关闭。
    pub fn evict(&self, address: &PhysicalAddress) -> bool {
        match self.inner.endpoints.remove(address) {
            Some((_, endpoint)) => {
                endpoint.close();
                self.inner.evictions.fetch_add(1, Ordering::AcqRel);
                info!(address = %address, "endpoint evicted");
                true
            }
            None => false,
        }
    }

    /// 执行一次空闲清扫，返回本次驱逐的端点数。
    pub fn sweep(&self, now: Instant) -> usize {
        self.inner.sweep(now)
    }

    /// 有界关闭：所有端点在 `deadline` 前完成优雅关闭。
    pub async fn close(&self, deadline: Instant) {
        let endpoints = match self.inner.shut() {
            Some(endpoints) => endpoints,
            None => return,
        };
        join_all(
            endpoints
                .iter()
                .map(|endpoint| endpoint.close_graceful(deadline)),
        )
        .await;
        info!(endpoints = endpoints.len(), "endpoint provider closed");
    }

    /// 同步关闭：强制关闭所有端点，不等待 IO 拆除。
    pub fn close_now(&self) {
        if let Some(endpoints) = self.inner.shut() {
            for endpoint in &endpoints {
                endpoint.close();
            }
            debug!(endpoints = endpoints.len(), "endpoint provider closed without waiting");
        }
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let endpoints: Vec<Endpoint> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        endpoints.iter().map(Endpoint::snapshot).collect()
    }
}

impl ProviderInner {
    fn sweep(&self, now: Instant) -> usize {
        let candidates: Vec<PhysicalAddress> = self
            .endpoints
            .iter()
            .filter(|entry| entry.value().is_idle(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for address in candidates {
            let removed = self
                .endpoints
                .remove_if(&address, |_, endpoint| endpoint.seal_if_idle(now));
            if let Some((_, endpoint)) = removed {
                endpoint.close_sealed();
                self.evictions.fetch_add(1, Ordering::AcqRel);
                evicted += 1;
                info!(address = %address, "evicted idle endpoint");
            }
        }
        evicted
    }

    /// 置位关闭标志并摘下全部端点；重复调用返回 `None`。
    fn shut(&self) -> Option<Vec<Endpoint>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let addresses: Vec<PhysicalAddress> = self
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        Some(
            addresses
                .iter()
                .filter_map(|address| self.endpoints.remove(address))
                .map(|(_, endpoint)| endpoint)
                .collect(),
        )
    }
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        for entry in self.endpoints.iter() {
            entry.value().close();
        }
    }
}

async fn run_sweeper(inner: Weak<ProviderInner>) {
    let resolution = match inner.upgrade() {
        Some(inner) => inner.options.timer_resolution(),
        None => return,
    };
    let mut ticker = tokio::time::interval(resolution);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        inner.sweep(Instant::now());
    }
}

impl std::fmt::Debug for EndpointProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointProvider")
            .field("endpoints", &self.count())
            .field("evictions", &self.evictions())
            .field("closed", &self.is_closed())
            .finish()
    }
}
