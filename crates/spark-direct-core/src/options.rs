//! # Options：直连传输的不可变配置
//!
//! ## 意图（Why）
//! - 端点池、通道与计时器都从同一份配置读取阈值；配置在客户端构造时一次性校验，
//!   运行期不再变化，热路径因此无需任何同步；
//! - 沿用 `with_*` 构建器风格，调用方只覆盖关心的项，其余取默认值。
//!
//! ## 契约（What）
//! - [`OptionsBuilder::build`] 校验全部不变式，违反时返回 [`ConfigError`]；
//! - [`Options::from_toml_str`] 接受以毫秒表示时长的 TOML 文档（`*_ms` 键），
//!   缺省键取默认值，未知键视为错误；
//! - `Options` 序列化为同样的毫秒形态，供诊断快照输出。

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::ConfigError;
use crate::frame::FRAME_HEADER_LEN;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IDLE_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_RECEIVE_HANG_DETECTION_TIME: Duration = Duration::from_secs(65);
const DEFAULT_SEND_HANG_DETECTION_TIME: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_TIMER_RESOLUTION: Duration = Duration::from_millis(100);
const DEFAULT_MAX_CHANNELS_PER_ENDPOINT: usize = 130;
const DEFAULT_MAX_REQUESTS_PER_CHANNEL: usize = 30;
const DEFAULT_BUFFER_PAGE_SIZE: usize = 8 * 1024;
const DEFAULT_MAX_BUFFER_CAPACITY: usize = 8 * 1024 * 1024;
const DEFAULT_USER_AGENT: &str = concat!("spark-direct/", env!("CARGO_PKG_VERSION"));

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

fn serialize_optional_millis<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

/// 直连传输配置。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `buffer_page_size ≤ max_buffer_capacity`，且 `max_buffer_capacity` 至少容纳一个帧头；
///   - 除 `idle_channel_timeout`（0 表示关闭通道空闲驱逐）外，所有时长严格为正；
///   - `max_channels_per_endpoint`、`max_requests_per_channel`、`partition_count` 严格为正；
///   - `user_agent` 非空；
/// - **风险 (Trade-offs)**：`max_buffer_capacity` 同时作为单帧长度上限，
///   超过该值的入站帧被视为协议错误。
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Options {
    #[serde(rename = "request_timeout_ms", serialize_with = "serialize_millis")]
    request_timeout: Duration,
    #[serde(rename = "connection_timeout_ms", serialize_with = "serialize_millis")]
    connection_timeout: Duration,
    #[serde(rename = "idle_channel_timeout_ms", serialize_with = "serialize_millis")]
    idle_channel_timeout: Duration,
    #[serde(rename = "idle_endpoint_timeout_ms", serialize_with = "serialize_millis")]
    idle_endpoint_timeout: Duration,
    #[serde(
        rename = "receive_hang_detection_time_ms",
        serialize_with = "serialize_millis"
    )]
    receive_hang_detection_time: Duration,
    #[serde(
        rename = "send_hang_detection_time_ms",
        serialize_with = "serialize_millis"
    )]
    send_hang_detection_time: Duration,
    #[serde(rename = "shutdown_timeout_ms", serialize_with = "serialize_millis")]
    shutdown_timeout: Duration,
    #[serde(rename = "timer_resolution_ms", serialize_with = "serialize_millis")]
    timer_resolution: Duration,
    max_channels_per_endpoint: usize,
    max_requests_per_channel: usize,
    partition_count: usize,
    buffer_page_size: usize,
    max_buffer_capacity: usize,
    user_agent: String,
    certificate_host_name_override: Option<String>,
    tcp_nodelay: bool,
    #[serde(rename = "tcp_keepalive_ms", serialize_with = "serialize_optional_millis")]
    tcp_keepalive: Option<Duration>,
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }

    /// 从 TOML 文本加载配置。
    ///
    /// ```
    /// use spark_direct_core::Options;
    ///
    /// let options = Options::from_toml_str(
    ///     "request_timeout_ms = 250\nmax_requests_per_channel = 4\n",
    /// )
    /// .expect("合法配置");
    /// assert_eq!(options.max_requests_per_channel(), 4);
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let document: OptionsDocument = toml::from_str(input).map_err(|err| ConfigError::Parse {
            detail: err.to_string(),
        })?;
        document.into_builder().build()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// 通道空闲驱逐阈值；`None` 表示未启用。
    pub fn idle_channel_timeout(&self) -> Option<Duration> {
        (!self.idle_channel_timeout.is_zero()).then_some(self.idle_channel_timeout)
    }

    pub fn idle_endpoint_timeout(&self) -> Duration {
        self.idle_endpoint_timeout
    }

    pub fn receive_hang_detection_time(&self) -> Duration {
        self.receive_hang_detection_time
    }

    pub fn send_hang_detection_time(&self) -> Duration {
        self.send_hang_detection_time
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// 通道计时器与端点池清扫的周期。
    pub fn timer_resolution(&self) -> Duration {
        self.timer_resolution
    }

    pub fn max_channels_per_endpoint(&self) -> usize {
        self.max_channels_per_endpoint
    }

    pub fn max_requests_per_channel(&self) -> usize {
        self.max_requests_per_channel
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn buffer_page_size(&self) -> usize {
        self.buffer_page_size
    }

    /// 读写缓冲上限，同时也是单帧长度上限。
    pub fn max_buffer_capacity(&self) -> usize {
        self.max_buffer_capacity
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn certificate_host_name_override(&self) -> Option<&str> {
        self.certificate_host_name_override.as_deref()
    }

    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }

    pub fn tcp_keepalive(&self) -> Option<Duration> {
        self.tcp_keepalive
    }
}

impl Default for Options {
    fn default() -> Self {
        OptionsBuilder::new().unchecked()
    }
}

/// [`Options`] 的构建器。
#[derive(Clone, Debug)]
pub struct OptionsBuilder {
    request_timeout: Duration,
    connection_timeout: Duration,
    idle_channel_timeout: Duration,
    idle_endpoint_timeout: Duration,
    receive_hang_detection_time: Duration,
    send_hang_detection_time: Duration,
    shutdown_timeout: Duration,
    timer_resolution: Duration,
    max_channels_per_endpoint: usize,
    max_requests_per_channel: usize,
    partition_count: usize,
    buffer_page_size: usize,
    max_buffer_capacity: usize,
    user_agent: String,
    certificate_host_name_override: Option<String>,
    tcp_nodelay: bool,
    tcp_keepalive: Option<Duration>,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            idle_channel_timeout: Duration::ZERO,
            idle_endpoint_timeout: DEFAULT_IDLE_ENDPOINT_TIMEOUT,
            receive_hang_detection_time: DEFAULT_RECEIVE_HANG_DETECTION_TIME,
            send_hang_detection_time: DEFAULT_SEND_HANG_DETECTION_TIME,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            timer_resolution: DEFAULT_TIMER_RESOLUTION,
            max_channels_per_endpoint: DEFAULT_MAX_CHANNELS_PER_ENDPOINT,
            max_requests_per_channel: DEFAULT_MAX_REQUESTS_PER_CHANNEL,
            partition_count: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            buffer_page_size: DEFAULT_BUFFER_PAGE_SIZE,
            max_buffer_capacity: DEFAULT_MAX_BUFFER_CAPACITY,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            certificate_host_name_override: None,
            tcp_nodelay: true,
            tcp_keepalive: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// 设置通道空闲驱逐阈值；`Duration::ZERO` 关闭该功能。
    pub fn with_idle_channel_timeout(mut self, timeout: Duration) -> Self {
        self.idle_channel_timeout = timeout;
        self
    }

    pub fn with_idle_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.idle_endpoint_timeout = timeout;
        self
    }

    pub fn with_receive_hang_detection_time(mut self, window: Duration) -> Self {
        self.receive_hang_detection_time = window;
        self
    }

    pub fn with_send_hang_detection_time(mut self, window: Duration) -> Self {
        self.send_hang_detection_time = window;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_timer_resolution(mut self, resolution: Duration) -> Self {
        self.timer_resolution = resolution;
        self
    }

    pub fn with_max_channels_per_endpoint(mut self, max: usize) -> Self {
        self.max_channels_per_endpoint = max;
        self
    }

    pub fn with_max_requests_per_channel(mut self, max: usize) -> Self {
        self.max_requests_per_channel = max;
        self
    }

    pub fn with_partition_count(mut self, count: usize) -> Self {
        self.partition_count = count;
        self
    }

    pub fn with_buffer_page_size(mut self, size: usize) -> Self {
        self.buffer_page_size = size;
        self
    }

    pub fn with_max_buffer_capacity(mut self, capacity: usize) -> Self {
        self.max_buffer_capacity = capacity;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// 设置 TLS 校验与 SNI 使用的主机名，替代地址中的主机。
    pub fn with_certificate_host_name_override(mut self, host: Option<String>) -> Self {
        self.certificate_host_name_override = host;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn with_tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = keepalive;
        self
    }

    /// 校验并冻结配置。
    pub fn build(self) -> Result<Options, ConfigError> {
        let durations = [
            ("request_timeout", self.request_timeout),
            ("connection_timeout", self.connection_timeout),
            ("idle_endpoint_timeout", self.idle_endpoint_timeout),
            ("receive_hang_detection_time", self.receive_hang_detection_time),
            ("send_hang_detection_time", self.send_hang_detection_time),
            ("shutdown_timeout", self.shutdown_timeout),
            ("timer_resolution", self.timer_resolution),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::NonPositive { field: *field });
        }
        if self.tcp_keepalive.is_some_and(|value| value.is_zero()) {
            return Err(ConfigError::NonPositive {
                field: "tcp_keepalive",
            });
        }

        let counts = [
            ("max_channels_per_endpoint", self.max_channels_per_endpoint),
            ("max_requests_per_channel", self.max_requests_per_channel),
            ("partition_count", self.partition_count),
            ("buffer_page_size", self.buffer_page_size),
        ];
        if let Some((field, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NonPositive { field: *field });
        }

        if self.max_buffer_capacity < FRAME_HEADER_LEN {
            return Err(ConfigError::CapacityBelowHeader {
                max: self.max_buffer_capacity,
                header: FRAME_HEADER_LEN,
            });
        }
        if self.buffer_page_size > self.max_buffer_capacity {
            return Err(ConfigError::PageExceedsCapacity {
                page: self.buffer_page_size,
                max: self.max_buffer_capacity,
            });
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "user_agent",
            });
        }
        if self
            .certificate_host_name_override
            .as_deref()
            .is_some_and(|host| host.trim().is_empty())
        {
            return Err(ConfigError::Empty {
                field: "certificate_host_name_override",
            });
        }

        Ok(self.unchecked())
    }

    fn unchecked(self) -> Options {
        Options {
            request_timeout: self.request_timeout,
            connection_timeout: self.connection_timeout,
            idle_channel_timeout: self.idle_channel_timeout,
            idle_endpoint_timeout: self.idle_endpoint_timeout,
            receive_hang_detection_time: self.receive_hang_detection_time,
            send_hang_detection_time: self.send_hang_detection_time,
            shutdown_timeout: self.shutdown_timeout,
            timer_resolution: self.timer_resolution,
            max_channels_per_endpoint: self.max_channels_per_endpoint,
            max_requests_per_channel: self.max_requests_per_channel,
            partition_count: self.partition_count,
            buffer_page_size: self.buffer_page_size,
            max_buffer_capacity: self.max_buffer_capacity,
            user_agent: self.user_agent,
            certificate_host_name_override: self.certificate_host_name_override,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive: self.tcp_keepalive,
        }
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// TOML 文档形态：所有键可缺省，时长以毫秒表示。
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsDocument {
    request_timeout_ms: Option<u64>,
    connection_timeout_ms: Option<u64>,
    idle_channel_timeout_ms: Option<u64>,
    idle_endpoint_timeout_ms: Option<u64>,
    receive_hang_detection_time_ms: Option<u64>,
    send_hang_detection_time_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    timer_resolution_ms: Option<u64>,
    max_channels_per_endpoint: Option<usize>,
    max_requests_per_channel: Option<usize>,
    partition_count: Option<usize>,
    buffer_page_size: Option<usize>,
    max_buffer_capacity: Option<usize>,
    user_agent: Option<String>,
    certificate_host_name_override: Option<String>,
    tcp_nodelay: Option<bool>,
    tcp_keepalive_ms: Option<u64>,
}

impl OptionsDocument {
    fn into_builder(self) -> OptionsBuilder {
        let millis = Duration::from_millis;
        let mut builder = OptionsBuilder::new();
        if let Some(value) = self.request_timeout_ms {
            builder = builder.with_request_timeout(millis(value));
        }
        if let Some(value) = self.connection_timeout_ms {
            builder = builder.with_connection_timeout(millis(value));
        }
        if let Some(value) = self.idle_channel_timeout_ms {
            builder = builder.with_idle_channel_timeout(millis(value));
        }
        if let Some(value) = self.idle_endpoint_timeout_ms {
            builder = builder.with_idle_endpoint_timeout(millis(value));
        }
        if let Some(value) = self.receive_hang_detection_time_ms {
            builder = builder.with_receive_hang_detection_time(millis(value));
        }
        if let Some(value) = self.send_hang_detection_time_ms {
            builder = builder.with_send_hang_detection_time(millis(value));
        }
        if let Some(value) = self.shutdown_timeout_ms {
            builder = builder.with_shutdown_timeout(millis(value));
        }
        if let Some(value) = self.timer_resolution_ms {
            builder = builder.with_timer_resolution(millis(value));
        }
        if let Some(value) = self.max_channels_per_endpoint {
            builder = builder.with_max_channels_per_endpoint(value);
        }
        if let Some(value) = self.max_requests_per_channel {
            builder = builder.with_max_requests_per_channel(value);
        }
        if let Some(value) = self.partition_count {
            builder = builder.with_partition_count(value);
        }
        if let Some(value) = self.buffer_page_size {
            builder = builder.with_buffer_page_size(value);
        }
        if let Some(value) = self.max_buffer_capacity {
            builder = builder.with_max_buffer_capacity(value);
        }
        if let Some(value) = self.user_agent {
            builder = builder.with_user_agent(value);
        }
        if self.certificate_host_name_override.is_some() {
            builder = builder.with_certificate_host_name_override(self.certificate_host_name_override);
        }
        if let Some(value) = self.tcp_nodelay {
            builder = builder.with_tcp_nodelay(value);
        }
        if let Some(value) = self.tcp_keepalive_ms {
            builder = builder.with_tcp_keepalive(Some(millis(value)));
        }
        builder
    }
}
