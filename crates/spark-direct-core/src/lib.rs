#![doc = r#"
# spark-direct-core

## 设计动机（Why）
- **定位**：为直连存储传输提供与运行时无关的契约层：配置、物理地址、帧格式、
  请求记录（单次赋值的完成单元）以及错误分类；
- **架构角色**：`spark-direct-tcp` 在 Tokio 上实现通道复用与端点池，本 crate 只描述
  “传输层看得见的东西”，不触碰套接字与定时器；
- **设计理念**：所有跨线程共享的状态（请求记录、配置）均为 `Send + Sync`，
  完成语义遵循“首次写入生效、后续调用无副作用”。

## 核心契约（What）
- [`Options`]：一次构建、全程只读的传输配置，构建时校验全部不变量；
- [`PhysicalAddress`]：副本的 `host:port` 身份，作为端点池的键；
- [`frame`]：16 字节定长头部 + 不透明负载的帧编解码；
- [`RequestRecord`]：在途请求的完成句柄，可 `await`，可注册续体；
- [`TransportError`]：带稳定错误码与 [`ErrorCategory`] 的错误分类。

## 风险与考量（Trade-offs）
- 请求记录的时间戳基于 `std::time::Instant`，与运行时的暂停时钟无关；
- 负载以 `bytes::Bytes` 表示，调用方负责应用层编码。
"#]

pub mod address;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod message;
pub mod options;
pub mod record;

pub use address::PhysicalAddress;
pub use diagnostics::{ChannelSnapshot, ChannelState, ClientSnapshot, EndpointSnapshot};
pub use error::{ConfigError, ErrorCategory, Result, TimeoutCause, TransportError};
pub use frame::{FRAME_HEADER_LEN, Frame, FrameDecoder, FrameError, FrameKind};
pub use message::{StoreRequest, StoreResponse};
pub use options::{Options, OptionsBuilder};
pub use record::{RecordFuture, RecordOutcome, RequestRecord};
