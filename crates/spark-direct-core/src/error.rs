//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义直连传输对外暴露的错误语义，区分“本地背压”“连接建立失败”“超时/挂起”
//!   “作用域已关闭”“协议解码失败”等类别，供上层重试层决定换副本还是退避；
//! - 每个变体都携带稳定错误码（`spark.direct.*`）与 [`ErrorCategory`]，便于告警聚合。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `Clone`：同一个关闭原因需要广播给通道内的每一条在途请求；
//! - 只有契约违规（非法地址、非法配置、已关闭作用域）会从 `send` 同步返回，
//!   其余错误经由 [`RequestRecord`](crate::RequestRecord) 的完成通道传播。

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::address::PhysicalAddress;

/// 传输层统一的 `Result` 别名。
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// 错误分类，指导上层的重试与熔断策略。
///
/// # 教案式说明
/// - **意图 (Why)**：错误码面向排障，分类面向决策；重试层只需要看分类；
/// - **契约 (What)**：`ResourceExhausted` 表示本地背压，可换通道/换副本或退避；
///   `Closed` 表示作用域终结，不应在同一句柄上重试。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCategory {
    /// 瞬时故障，可直接重试。
    Retryable,
    /// 本地容量耗尽（通道或端点已满）。
    ResourceExhausted,
    /// 截止时间或挂起检测触发。
    Timeout,
    /// 调用方主动取消。
    Cancelled,
    /// 通道、端点、端点池或客户端已关闭。
    Closed,
    /// 对端发送了无法解析的帧。
    ProtocolViolation,
    /// 重试无意义的失败。
    NonRetryable,
}

impl ErrorCategory {
    /// 换一个新请求重试是否可能成功。
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Retryable | ErrorCategory::ResourceExhausted | ErrorCategory::Timeout
        )
    }
}

/// 请求超时的触发来源。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TimeoutCause {
    /// 请求级截止时间（`request_timeout`）到期，连接本身仍被视为健康。
    Deadline,
    /// 出站写入在 `send_hang_detection_time` 内没有任何进展。
    SendHang,
    /// 请求已完整写出，但在 `receive_hang_detection_time` 内没有读到任何字节。
    ReceiveHang,
}

impl TimeoutCause {
    /// 是否属于挂起检测；挂起意味着连接可能已卡死，通道需要退役。
    pub fn is_hang(self) -> bool {
        matches!(self, TimeoutCause::SendHang | TimeoutCause::ReceiveHang)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutCause::Deadline => "deadline",
            TimeoutCause::SendHang => "send_hang",
            TimeoutCause::ReceiveHang => "receive_hang",
        }
    }
}

impl fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 配置校验失败。
///
/// - **契约 (What)**：`field` 为配置项的 snake_case 名称，与 TOML 键（去掉 `_ms` 后缀）一致；
/// - **风险 (Trade-offs)**：解析错误只保留文本描述，避免把 `toml` 的错误类型泄漏到公共 API。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    #[error("option `{field}` must be strictly positive")]
    NonPositive { field: &'static str },

    #[error("option `{field}` must not be empty")]
    Empty { field: &'static str },

    #[error("buffer page size {page} exceeds max buffer capacity {max}")]
    PageExceedsCapacity { page: usize, max: usize },

    #[error("max buffer capacity {max} cannot hold a {header}-byte frame header")]
    CapacityBelowHeader { max: usize, header: usize },

    #[error("failed to parse transport options: {detail}")]
    Parse { detail: String },
}

/// 直连传输的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把通道、端点、端点池与客户端各层的失败收敛为一个可克隆的枚举，
///   使“关闭原因广播给所有在途请求”这一操作无需额外包装；
/// - **契约 (What)**：
///   - 所有变体均 `Send + Sync + 'static`；
///   - [`TransportError::code`] 返回稳定错误码，[`TransportError::category`] 返回分类；
///   - `CapacityExceeded` 与 `EndpointSaturated` 同属背压，
///     [`TransportError::is_capacity_exceeded`] 对二者均返回 `true`；
/// - **设计权衡 (Trade-offs)**：上下文以 `String`/`Cow` 保存，牺牲少量分配换取可读性。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TransportError {
    /// 单个通道的在途请求数已达 `max_requests_per_channel`。
    #[error("channel to {address} is at capacity ({limit} outstanding requests)")]
    CapacityExceeded {
        address: PhysicalAddress,
        limit: usize,
    },

    /// 端点的所有通道都已满，且通道数已达 `max_channels_per_endpoint`。
    #[error(
        "endpoint {address} is saturated: {channels} channels with {limit_per_channel} outstanding requests each"
    )]
    EndpointSaturated {
        address: PhysicalAddress,
        channels: usize,
        limit_per_channel: usize,
    },

    /// TCP 建连或 TLS 握手失败；不会使端点永久失效。
    #[error("failed to connect to {address}: {detail}")]
    ConnectionFailed {
        address: PhysicalAddress,
        kind: io::ErrorKind,
        detail: String,
    },

    /// 截止时间或挂起检测到期。
    #[error("request {correlation_id} to {address} timed out ({cause}) after {elapsed:?}")]
    RequestTimeout {
        address: PhysicalAddress,
        correlation_id: u64,
        cause: TimeoutCause,
        elapsed: Duration,
    },

    /// 通道已关闭（显式关闭、挂起退役、协议错误或对端断开）。
    #[error("channel to {address} closed: {reason}")]
    ChannelClosed {
        address: PhysicalAddress,
        reason: Cow<'static, str>,
    },

    /// 端点已被驱逐或关闭。
    #[error("endpoint {address} is closed")]
    EndpointClosed { address: PhysicalAddress },

    #[error("endpoint provider is closed")]
    ProviderClosed,

    #[error("transport client is closed")]
    ClientClosed,

    /// 调用方取消了请求，迟到的响应将被丢弃。
    #[error("request {correlation_id} to {address} was cancelled")]
    Cancelled {
        address: PhysicalAddress,
        correlation_id: u64,
    },

    /// 入站帧无法解析。
    #[error("malformed frame from {address}: {detail}")]
    Decode {
        address: PhysicalAddress,
        correlation_id: Option<u64>,
        detail: String,
    },

    /// 后端以非零状态码拒绝了请求。
    #[error("backend {address} rejected request {correlation_id} with status {status}: {message}")]
    Server {
        address: PhysicalAddress,
        correlation_id: u64,
        status: u16,
        message: String,
    },

    /// 请求帧超过 `max_buffer_capacity`，在进入通道之前即被拒绝。
    #[error("request to {address} of {length} bytes exceeds the {max}-byte frame limit")]
    FrameTooLarge {
        address: PhysicalAddress,
        length: usize,
        max: usize,
    },

    #[error("invalid physical address `{input}`: {detail}")]
    InvalidAddress { input: String, detail: &'static str },

    #[error("invalid transport options: {0}")]
    Config(#[from] ConfigError),

    /// 在 Tokio 运行时之外构造了客户端。
    #[error("no Tokio runtime available: {detail}")]
    RuntimeUnavailable { detail: String },
}

impl TransportError {
    /// 稳定错误码，供日志与指标聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::CapacityExceeded { .. } => "spark.direct.capacity_exceeded",
            TransportError::EndpointSaturated { .. } => "spark.direct.endpoint_saturated",
            TransportError::ConnectionFailed { .. } => "spark.direct.connect_failed",
            TransportError::RequestTimeout { cause, .. } => match cause {
                TimeoutCause::Deadline => "spark.direct.timeout.deadline",
                TimeoutCause::SendHang => "spark.direct.timeout.send_hang",
                TimeoutCause::ReceiveHang => "spark.direct.timeout.receive_hang",
            },
            TransportError::ChannelClosed { .. } => "spark.direct.channel_closed",
            TransportError::EndpointClosed { .. } => "spark.direct.endpoint_closed",
            TransportError::ProviderClosed => "spark.direct.provider_closed",
            TransportError::ClientClosed => "spark.direct.client_closed",
            TransportError::Cancelled { .. } => "spark.direct.cancelled",
            TransportError::Decode { .. } => "spark.direct.decode_failed",
            TransportError::Server { .. } => "spark.direct.server_error",
            TransportError::FrameTooLarge { .. } => "spark.direct.frame_too_large",
            TransportError::InvalidAddress { .. } => "spark.direct.invalid_address",
            TransportError::Config(_) => "spark.direct.invalid_options",
            TransportError::RuntimeUnavailable { .. } => "spark.direct.runtime_unavailable",
        }
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::CapacityExceeded { .. } | TransportError::EndpointSaturated { .. } => {
                ErrorCategory::ResourceExhausted
            }
            TransportError::ConnectionFailed { kind, .. } => categorize_io_kind(*kind),
            TransportError::RequestTimeout { .. } => ErrorCategory::Timeout,
            TransportError::ChannelClosed { .. }
            | TransportError::EndpointClosed { .. }
            | TransportError::ProviderClosed
            | TransportError::ClientClosed => ErrorCategory::Closed,
            TransportError::Cancelled { .. } => ErrorCategory::Cancelled,
            TransportError::Decode { .. } => ErrorCategory::ProtocolViolation,
            TransportError::Server { .. }
            | TransportError::FrameTooLarge { .. }
            | TransportError::InvalidAddress { .. }
            | TransportError::Config(_)
            | TransportError::RuntimeUnavailable { .. } => ErrorCategory::NonRetryable,
        }
    }

    /// 是否为本地背压信号（通道已满或端点饱和）。
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(
            self,
            TransportError::CapacityExceeded { .. } | TransportError::EndpointSaturated { .. }
        )
    }

    /// 是否由挂起检测触发；此时来源通道已经退役。
    pub fn is_hang(&self) -> bool {
        matches!(self, TransportError::RequestTimeout { cause, .. } if cause.is_hang())
    }

    /// 基于 IO 错误构造建连失败。
    pub fn connection_failed(address: PhysicalAddress, operation: &str, error: &io::Error) -> Self {
        TransportError::ConnectionFailed {
            address,
            kind: error.kind(),
            detail: format!("{operation}: {error}"),
        }
    }

    pub fn channel_closed(address: PhysicalAddress, reason: impl Into<Cow<'static, str>>) -> Self {
        TransportError::ChannelClosed {
            address,
            reason: reason.into(),
        }
    }
}

/// 将 IO 错误类型映射为分类：连接被拒/重置属于瞬时故障，权限与不支持则不可重试。
pub fn categorize_io_kind(kind: io::ErrorKind) -> ErrorCategory {
    use io::ErrorKind;
    match kind {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported | ErrorKind::InvalidData => {
            ErrorCategory::NonRetryable
        }
        _ => ErrorCategory::NonRetryable,
    }
}
