//! 诊断快照：客户端、端点与通道的只读视图。
//!
//! 快照在采集瞬间拷贝计数器，之后与运行中的对象再无关联；全部实现 `Serialize`，
//! 由 `TransportClient::diagnostics_json` 输出。

use serde::Serialize;

use crate::address::PhysicalAddress;
use crate::options::Options;

/// 通道生命周期状态。
///
/// ```text
/// Connecting ──► Open ──► Draining ──► Closed
///      │           └──────────────────►  ▲
///      └─────────────────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// 写任务正在建连，请求可以排队。
    Connecting,
    /// 连接可用。
    Open,
    /// 不再接受新请求，在途请求可以继续完成。
    Draining,
    /// 终态。
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Draining => "draining",
            ChannelState::Closed => "closed",
        }
    }

    /// 是否还接受新请求。
    pub fn accepts_requests(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }

    /// 原子存储用的编码。
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Draining,
            _ => ChannelState::Closed,
        }
    }
}

/// 单个通道的快照。
#[derive(Clone, Debug, Serialize)]
pub struct ChannelSnapshot {
    pub id: u64,
    pub state: ChannelState,
    pub healthy: bool,
    pub outstanding: usize,
    pub requests_sent: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub idle_for_ms: u64,
}

/// 单个端点的快照。
#[derive(Clone, Debug, Serialize)]
pub struct EndpointSnapshot {
    pub address: PhysicalAddress,
    pub closed: bool,
    pub outstanding: usize,
    pub requests_accepted: u64,
    pub responses: u64,
    pub failures: u64,
    pub channels_opened: u64,
    pub channels_retired: u64,
    pub channels_idle_evicted: u64,
    pub idle_for_ms: u64,
    pub channels: Vec<ChannelSnapshot>,
}

/// 客户端级快照。
#[derive(Clone, Debug, Serialize)]
pub struct ClientSnapshot {
    pub id: u64,
    pub closed: bool,
    pub endpoint_count: usize,
    pub endpoint_evictions: u64,
    pub options: Options,
    pub endpoints: Vec<EndpointSnapshot>,
}
