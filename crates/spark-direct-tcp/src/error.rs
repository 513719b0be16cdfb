use std::borrow::Cow;
use std::io;
use std::time::Duration;

use spark_direct_core::{PhysicalAddress, TransportError};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.direct.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const TLS_HANDSHAKE: OperationKind = OperationKind {
    code: "spark.direct.tls.handshake_failed",
    message: "tls handshake",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.direct.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.direct.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.direct.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.direct.tcp.shutdown_failed",
    message: "tcp shutdown",
};

/// 建连阶段的 IO 错误统一映射为 `ConnectionFailed`，分类由 `io::ErrorKind` 决定。
pub(crate) fn map_io_error(
    kind: OperationKind,
    address: &PhysicalAddress,
    error: io::Error,
) -> TransportError {
    TransportError::connection_failed(address.clone(), kind.message, &error)
}

/// 建连超过 `connection_timeout`。
pub(crate) fn timeout_error(
    kind: OperationKind,
    address: &PhysicalAddress,
    budget: Duration,
) -> TransportError {
    TransportError::ConnectionFailed {
        address: address.clone(),
        kind: io::ErrorKind::TimedOut,
        detail: format!("{} timed out after {budget:?}", kind.message),
    }
}

/// 建连过程中通道被关闭。
pub(crate) fn cancelled_error(kind: OperationKind, address: &PhysicalAddress) -> TransportError {
    TransportError::channel_closed(address.clone(), format!("{} cancelled", kind.message))
}

/// 连接建立之后的 IO 失败只作为通道关闭原因出现。
pub(crate) fn close_reason(kind: OperationKind, error: &io::Error) -> Cow<'static, str> {
    Cow::Owned(format!("{}: {}", kind.message, error))
}
