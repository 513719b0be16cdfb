//! # TransportClient：直连传输的外观
//!
//! ## 意图（Why）
//! - 调用方只面对“向某个物理地址发送请求”这一件事，端点池、通道与计时器都是内部细节；
//! - 客户端显式拥有端点池：构造即创建，关闭即拆除，不存在进程级共享状态。
//!
//! ## 契约（What）
//! - [`TransportClient::invoke_store_async`] 非阻塞，返回可等待的 [`RequestRecord`]；
//! - [`TransportClient::invoke`] 等待结果，丢弃返回的 Future 会取消请求；
//! - [`TransportClient::close`] 只有首个调用者执行拆除，总耗时受 `shutdown_timeout` 约束；
//!   之后的调用立即返回；未关闭即析构时执行同步拆除。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use spark_direct_core::{
    ClientSnapshot, Options, PhysicalAddress, RequestRecord, StoreRequest, StoreResponse,
    TransportError,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::connector::{Connector, TcpConnector};
use crate::provider::EndpointProvider;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// 直连传输客户端。
pub struct TransportClient {
    id: u64,
    options: Arc<Options>,
    provider: EndpointProvider,
    closed: AtomicBool,
}

impl TransportClient {
    /// 使用明文 TCP 连接器创建客户端；必须在 Tokio 运行时内调用。
    pub fn new(options: Options) -> Result<Self, TransportError> {
        Self::with_connector(options, Arc::new(TcpConnector::new()))
    }

    /// 从 TOML 文本读取配置并创建明文 TCP 客户端；配置错误以 `Config` 返回。
    pub fn from_toml(input: &str) -> Result<Self, TransportError> {
        let options = Options::from_toml_str(input)?;
        Self::new(options)
    }

    /// 使用自定义连接器（例如 [`TlsConnector`](crate::TlsConnector)）创建客户端。
    pub fn with_connector(
        options: Options,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|err| TransportError::RuntimeUnavailable {
            detail: err.to_string(),
        })?;
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let options = Arc::new(options);
        let provider = EndpointProvider::new(Arc::clone(&options), connector, runtime);
        debug!(client_id = id, "transport client created");
        Ok(Self {
            id,
            options,
            provider,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn endpoint_count(&self) -> usize {
        self.provider.count()
    }

    pub fn endpoint_eviction_count(&self) -> u64 {
        self.provider.evictions()
    }

    /// 底层端点池，供需要直接操作端点的调用方使用。
    pub fn provider(&self) -> &EndpointProvider {
        &self.provider
    }

    /// 向 `address` 提交请求，立即返回记录。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：同步错误只有两类：作用域已关闭（`ClientClosed`/`ProviderClosed`）
    ///   与本地背压（`CapacityExceeded`/`EndpointSaturated`）；其余失败经由记录交付；
    /// - **逻辑 (How)**：端点在查找与提交之间被驱逐时（`EndpointClosed`）重新查找一次。
    pub fn invoke_store_async(
        &self,
        address: &PhysicalAddress,
        request: StoreRequest,
    ) -> Result<RequestRecord, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ClientClosed);
        }
        let endpoint = self.provider.get(address)?;
        match endpoint.send(request.clone()) {
            Err(TransportError::EndpointClosed { .. }) => {
                debug!(address = %address, "endpoint evicted during send, retrying lookup");
                self.provider.get(address)?.send(request)
            }
            other => other,
        }
    }

    /// 提交请求并等待结果；Future 被丢弃时取消请求。
    pub async fn invoke(
        &self,
        address: &PhysicalAddress,
        request: StoreRequest,
    ) -> Result<StoreResponse, TransportError> {
        let record = self.invoke_store_async(address, request)?;
        let guard = CancelOnDrop {
            record: Some(record.clone()),
        };
        let outcome = record.await;
        guard.disarm();
        outcome
    }

    /// 关闭客户端，在 `shutdown_timeout` 内完成。
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let started = Instant::now();
        self.provider
            .close(started + self.options.shutdown_timeout())
            .await;
        info!(
            client_id = self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transport client closed"
        );
    }

    pub fn diagnostics(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id,
            closed: self.is_closed(),
            endpoint_count: self.provider.count(),
            endpoint_evictions: self.provider.evictions(),
            options: self.options.as_ref().clone(),
            endpoints: self.provider.snapshot(),
        }
    }

    /// 以 JSON 输出诊断快照。
    pub fn diagnostics_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.diagnostics())
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.provider.close_now();
            debug!(client_id = self.id, "transport client dropped without close");
        }
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("provider", &self.provider)
            .finish()
    }
}

struct CancelOnDrop {
    record: Option<RequestRecord>,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.record = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            record.cancel(true);
        }
    }
}
