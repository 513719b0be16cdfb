#![doc = r#"
# spark-direct-tcp

## 设计动机（Why）
- **定位**：在 Tokio 之上实现直连存储传输：按副本物理地址维护端点池，
  每个端点在有限数量的长连接通道上多路复用在途请求；
- **架构角色**：[`TransportClient`] 是唯一的外观，内部依次委派给
  [`EndpointProvider`] → [`Endpoint`] → [`Channel`]；契约类型来自 `spark-direct-core`；
- **设计理念**：调用方永不阻塞，`send` 只做容量预留与入队；建连、读写、
  截止时间与挂起检测都运行在后台任务中，结果经由 [`RequestRecord`] 交付。

## 核心契约（What）
- 通道的在途请求数不超过 `max_requests_per_channel`，端点的通道数不超过
  `max_channels_per_endpoint`；超出时同步返回背压错误；
- 每条记录恰好完成一次，完成时恰好归还一个容量单位；
- 同一地址并发获取端点，至多创建一个实例；
- 关闭客户端在 `shutdown_timeout` 内完成，所有在途请求都会得到结果。

## 实现策略（How）
- 每个通道拥有三个任务：写任务（建连 + 串行写出）、读任务（解帧 + 按关联 ID 分发）、
  计时任务（截止时间、挂起与空闲检测）；
- 端点的通道列表使用 `arc-swap` 快照，读路径无锁；结构变更由端点级互斥锁串行化；
- 端点池基于 `DashMap` 的 entry API 保证单实例创建，后台清扫只持有弱引用。

## 风险与考量（Trade-offs）
- 挂起检测以计时器分辨率为粒度，检测延迟最多多出一个 `timer_resolution`；
- 强制关闭后仍未退出的 IO 任务会被放弃，只记录告警日志。
"#]

mod channel;
mod client;
mod connector;
mod endpoint;
mod error;
mod io;
mod progress;
mod provider;
mod timer;
mod util;

pub use channel::Channel;
pub use client::TransportClient;
pub use connector::{BoxedStream, Connector, TcpConnector, TlsConnector, TransportStream};
pub use endpoint::Endpoint;
pub use provider::EndpointProvider;

pub use spark_direct_core::{
    ChannelSnapshot, ChannelState, ClientSnapshot, EndpointSnapshot, ErrorCategory, Options,
    OptionsBuilder, PhysicalAddress, RecordOutcome, RequestRecord, StoreRequest, StoreResponse,
    TimeoutCause, TransportError,
};
