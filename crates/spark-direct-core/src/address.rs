//! 副本物理地址。

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::error::TransportError;

/// 一个副本的 `host:port` 身份，作为端点池的键。
///
/// # 教案式说明
/// - **意图 (Why)**：传输层从不解析路由，只接受上游给出的物理地址；
///   用强类型避免“同一副本因字符串形式不同而建出两个端点”；
/// - **契约 (What)**：`host` 非空、`port` 非零；`host` 以 `Arc<str>` 共享，克隆零拷贝；
///   解析时接受 `host:port`、`[v6]:port` 与 `scheme://host:port/path`（路径被忽略）；
/// - **风险 (Trade-offs)**：不做 DNS 规范化，`localhost` 与 `127.0.0.1` 视为不同端点。
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysicalAddress {
    host: Arc<str>,
    port: u16,
}

impl PhysicalAddress {
    pub fn new(host: impl AsRef<str>, port: u16) -> Result<Self, TransportError> {
        let host = host.as_ref();
        let display = format!("{host}:{port}");
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::InvalidAddress {
                input: display,
                detail: "host is empty",
            });
        }
        if port == 0 {
            return Err(TransportError::InvalidAddress {
                input: display,
                detail: "port must be non-zero",
            });
        }
        Ok(Self {
            host: Arc::from(host),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PhysicalAddress {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |detail| TransportError::InvalidAddress {
            input: input.to_owned(),
            detail,
        };

        let rest = match input.split_once("://") {
            Some((_, rest)) => rest,
            None => input,
        };
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            authority
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("port is not a number"))?;
        PhysicalAddress::new(host, port).map_err(|_| invalid("host is empty or port is zero"))
    }
}

impl From<SocketAddr> for PhysicalAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: Arc::from(addr.ip().to_string()),
            port: addr.port(),
        }
    }
}

impl Serialize for PhysicalAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
