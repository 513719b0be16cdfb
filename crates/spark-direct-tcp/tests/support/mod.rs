//! 集成测试使用的假后端：监听回环地址，按预设行为应答请求帧。

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use spark_direct_core::{
    FRAME_HEADER_LEN, Frame, FrameDecoder, FrameKind, Options, PhysicalAddress,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

const MAX_FRAME: usize = 128 * 1024 * 1024;

/// 后端对请求帧的处理方式。
#[derive(Clone, Debug)]
pub enum Behavior {
    /// 原样回显负载。
    Echo,
    /// 读取请求但从不应答。
    Silent,
    /// 接受连接后从不读取，写方最终被 TCP 窗口阻塞。
    NoRead,
    /// 以固定的非零状态码与消息拒绝请求。
    Reject { status: u16, message: &'static str },
    /// 先发送一个无人认领的关联 ID，再正常回显。
    StrayThenEcho,
    /// 攒满 `batch` 个请求后倒序回显。
    Reversed { batch: usize },
    /// 应答帧头的类型字节被替换为 `kind`，关联 ID 保持不变。
    MisKind { kind: u8 },
}

/// 运行中的假后端。
pub struct Backend {
    address: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl Backend {
    pub async fn spawn(behavior: Behavior) -> Self {
        Self::spawn_with_tls(behavior, None).await
    }

    pub async fn spawn_with_tls(behavior: Behavior, tls: Option<Arc<ServerConfig>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定回环端口");
        let address = listener.local_addr().expect("读取监听地址");
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let acceptor = tls.map(tokio_rustls::TlsAcceptor::from);

        let counter = Arc::clone(&accepted);
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                let seen = Arc::clone(&seen);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(tls) = acceptor.accept(stream).await {
                                serve(tls, behavior, seen).await;
                            }
                        }
                        None => serve(stream, behavior, seen).await,
                    }
                });
            }
        });

        Self {
            address,
            accepted,
            requests,
        }
    }

    pub fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new("127.0.0.1", self.address.port()).expect("合法地址")
    }

    /// 以指定主机名访问同一端口，用于 TLS 主机名覆盖场景。
    pub fn address_with_host(&self, host: &str) -> PhysicalAddress {
        PhysicalAddress::new(host, self.address.port()).expect("合法地址")
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn serve<S>(mut stream: S, behavior: Behavior, seen: Arc<AtomicUsize>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if matches!(behavior, Behavior::NoRead) {
        std::future::pending::<()>().await;
        return;
    }

    let mut decoder = FrameDecoder::new(MAX_FRAME);
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    let mut held: Vec<Frame> = Vec::new();
    loop {
        match stream.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        while let Ok(Some(frame)) = decoder.decode(&mut buffer) {
            if frame.kind() != FrameKind::Request {
                continue;
            }
            seen.fetch_add(1, Ordering::SeqCst);
            let id = frame.correlation_id();
            if let Behavior::MisKind { kind } = &behavior {
                let raw = raw_frame(*kind, id, frame.payload());
                if stream.write_all(&raw).await.is_err() || stream.flush().await.is_err() {
                    return;
                }
                continue;
            }
            let replies = match &behavior {
                Behavior::Echo => vec![Frame::response(id, 0, frame.into_payload())],
                Behavior::Silent | Behavior::NoRead | Behavior::MisKind { .. } => Vec::new(),
                Behavior::Reject { status, message } => {
                    vec![Frame::response(id, *status, Bytes::from_static(message.as_bytes()))]
                }
                Behavior::StrayThenEcho => vec![
                    Frame::response(id.wrapping_add(1_000_000), 0, Bytes::from_static(b"stray")),
                    Frame::response(id, 0, frame.into_payload()),
                ],
                Behavior::Reversed { batch } => {
                    held.push(frame);
                    if held.len() < *batch {
                        Vec::new()
                    } else {
                        held.drain(..)
                            .rev()
                            .map(|frame| {
                                Frame::response(frame.correlation_id(), 0, frame.into_payload())
                            })
                            .collect()
                    }
                }
            };
            for reply in replies {
                let bytes = reply.to_bytes(MAX_FRAME).expect("编码应答帧");
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            if stream.flush().await.is_err() {
                return;
            }
        }
    }
}

/// 按线格式手工拼出一帧，`kind` 可以是任意字节。
fn raw_frame(kind: u8, correlation_id: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le((FRAME_HEADER_LEN + payload.len()) as u32);
    buf.put_u8(kind);
    buf.put_u8(0);
    buf.put_u16_le(0);
    buf.put_u64_le(correlation_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// 测试用的基础配置：计时器分辨率缩短到 10ms，挂起窗口足够宽以免误判。
pub fn options() -> spark_direct_core::OptionsBuilder {
    Options::builder()
        .with_request_timeout(Duration::from_secs(5))
        .with_connection_timeout(Duration::from_secs(2))
        .with_receive_hang_detection_time(Duration::from_secs(3))
        .with_send_hang_detection_time(Duration::from_secs(3))
        .with_shutdown_timeout(Duration::from_millis(500))
        .with_timer_resolution(Duration::from_millis(10))
}

/// 生成 `host` 的自签名证书，返回服务端配置与只信任该证书的客户端配置。
pub fn tls_pair(host: &str) -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let params = rcgen::CertificateParams::new(vec![host.to_string()]).expect("构造证书参数");
    let key_pair = rcgen::KeyPair::generate().expect("生成私钥");
    let certificate = params.self_signed(&key_pair).expect("签发自签名证书");
    let cert_der = CertificateDer::from(certificate.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).expect("解析私钥");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("服务端 TLS 配置");

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("加入根证书");
    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server), Arc::new(client))
}
