//! 请求与响应的不透明负载。

use bytes::Bytes;

/// 发往后端的一次存储请求。负载的应用层编码由上游编解码器负责。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreRequest {
    payload: Bytes,
}

impl StoreRequest {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// 后端对某个关联 ID 的成功响应。
///
/// - **契约 (What)**：`status` 恒为 0；非零状态在通道侧被转换为
///   [`TransportError::Server`](crate::TransportError::Server)，不会以响应形式交付。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreResponse {
    correlation_id: u64,
    status: u16,
    payload: Bytes,
}

impl StoreResponse {
    pub fn new(correlation_id: u64, status: u16, payload: Bytes) -> Self {
        Self {
            correlation_id,
            status,
            payload,
        }
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
