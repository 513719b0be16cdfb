//! # 帧格式
//!
//! ## 意图（Why）
//! - 传输层只拥有“足以完成多路复用”的帧头：总长度、帧类型、状态码与关联 ID；
//!   负载对传输层完全不透明；
//! - 请求与响应共用同一种 16 字节定长头部，解码器因此可同时服务客户端与测试用后端。
//!
//! ## 契约（What）
//! ```text
//! offset  size  field
//! 0       4     总长度（头部 + 负载，小端）
//! 4       1     帧类型：1 = 请求，2 = 响应
//! 5       1     保留标志位，编码写 0，解码忽略
//! 6       2     状态码：0 = 成功，非 0 = 后端错误（负载为 UTF-8 描述）
//! 8       8     关联 ID（小端）
//! ```
//! - 长度小于头部或超过 `max_frame_len`：致命错误，流无法再同步；
//! - 类型字节未知：非致命，帧已被完整消费，可凭关联 ID 让对应请求失败。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 定长帧头的字节数。
pub const FRAME_HEADER_LEN: usize = 16;

/// 帧类型。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameKind::Request),
            2 => Some(FrameKind::Response),
            _ => None,
        }
    }
}

/// 编解码失败。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum FrameError {
    /// 声明的帧长度不合法，之后的字节流无法再对齐。
    #[error("frame length {length} is outside [{min}, {max}]")]
    InvalidLength { length: usize, min: usize, max: usize },

    /// 帧已消费，但类型字节无法识别。
    #[error("frame {correlation_id} carries unknown kind {kind}")]
    UnknownKind { kind: u8, correlation_id: u64 },

    /// 帧类型合法，但不该出现在当前方向（例如客户端收到请求帧）。
    #[error("frame {correlation_id} has unexpected kind {kind:?}")]
    UnexpectedKind {
        kind: FrameKind,
        correlation_id: u64,
    },

    /// 编码时负载超过上限。
    #[error("payload of {length} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge { length: usize, max: usize },
}

impl FrameError {
    /// 致命错误意味着连接必须关闭。
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::InvalidLength { .. })
    }

    /// 若错误仍能定位到某个请求，返回其关联 ID。
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            FrameError::UnknownKind { correlation_id, .. }
            | FrameError::UnexpectedKind { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }
}

/// 一个完整的帧。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    kind: FrameKind,
    status: u16,
    correlation_id: u64,
    payload: Bytes,
}

impl Frame {
    pub fn request(correlation_id: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Request,
            status: 0,
            correlation_id,
            payload,
        }
    }

    pub fn response(correlation_id: u64, status: u16, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Response,
            status,
            correlation_id,
            payload,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// 编码后的总字节数。
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// 将帧追加写入 `dst`。
    ///
    /// - **前置条件**：`encoded_len()` 不超过 `max_frame_len` 且能用 `u32` 表示；
    /// - **后置条件**：失败时 `dst` 保持不变。
    pub fn encode(&self, dst: &mut BytesMut, max_frame_len: usize) -> Result<(), FrameError> {
        let length = self.encoded_len();
        let max = max_frame_len.min(u32::MAX as usize);
        if length > max {
            return Err(FrameError::PayloadTooLarge {
                length: self.payload.len(),
                max: max.saturating_sub(FRAME_HEADER_LEN),
            });
        }
        dst.reserve(length);
        dst.put_u32_le(length as u32);
        dst.put_u8(self.kind as u8);
        dst.put_u8(0);
        dst.put_u16_le(self.status);
        dst.put_u64_le(self.correlation_id);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// 编码为独立的 `Bytes`，供写队列直接持有。
    pub fn to_bytes(&self, max_frame_len: usize) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf, max_frame_len)?;
        Ok(buf.freeze())
    }
}

/// 增量解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：读循环按页读入字节，一次读取可能包含半个帧或多个帧；
/// - **契约 (What)**：`decode` 每次至多产出一个帧；输入不足时返回 `Ok(None)` 且不消费字节；
///   非致命错误返回前已消费该帧，调用方可继续解码；
/// - **风险 (Trade-offs)**：解码器不负责扩容，缓冲增长策略由读循环按页大小决定。
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// 当前缓冲中第一个帧还缺多少字节；不足 4 字节时以头部长度估算。
    pub fn missing(&self, src: &BytesMut) -> usize {
        if src.len() < 4 {
            return FRAME_HEADER_LEN - src.len();
        }
        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        length.saturating_sub(src.len())
    }

    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < FRAME_HEADER_LEN || length > self.max_frame_len {
            return Err(FrameError::InvalidLength {
                length,
                min: FRAME_HEADER_LEN,
                max: self.max_frame_len,
            });
        }
        if src.len() < length {
            return Ok(None);
        }

        let mut frame = src.split_to(length).freeze();
        frame.advance(4);
        let kind = frame.get_u8();
        let _flags = frame.get_u8();
        let status = frame.get_u16_le();
        let correlation_id = frame.get_u64_le();

        let kind = FrameKind::from_byte(kind).ok_or(FrameError::UnknownKind {
            kind,
            correlation_id,
        })?;
        Ok(Some(Frame {
            kind,
            status,
            correlation_id,
            payload: frame,
        }))
    }
}
