//! 直连传输的端到端场景：容量、挂起检测、驱逐、关闭与 TLS。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use spark_direct_core::{
    ErrorCategory, Options, PhysicalAddress, StoreRequest, TimeoutCause, TransportError,
};
use spark_direct_tcp::{
    BoxedStream, Connector, TcpConnector, TlsConnector, TransportClient,
};
use support::{Backend, Behavior};
use tracing_test::traced_test;

fn request(payload: &'static [u8]) -> StoreRequest {
    StoreRequest::new(Bytes::from_static(payload))
}

/// 轮询直到条件成立或超时。
async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trip() {
    let backend = Backend::spawn(Behavior::Echo).await;
    let client = TransportClient::new(support::options().build().expect("合法配置"))
        .expect("创建客户端");

    let response = client
        .invoke(&backend.address(), request(b"get:alpha"))
        .await
        .expect("应答成功");
    assert_eq!(response.status(), 0);
    assert_eq!(response.payload().as_ref(), b"get:alpha");
    assert_eq!(client.endpoint_count(), 1);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn third_request_on_full_endpoint_is_rejected_locally() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let options = support::options()
        .with_max_requests_per_channel(2)
        .with_max_channels_per_endpoint(1)
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");
    let address = backend.address();

    let first = client.invoke_store_async(&address, request(b"1")).expect("第一个请求");
    let second = client.invoke_store_async(&address, request(b"2")).expect("第二个请求");
    let third = client
        .invoke_store_async(&address, request(b"3"))
        .expect_err("第三个请求应被拒绝");
    assert!(third.is_capacity_exceeded(), "实际错误: {third:?}");
    assert_eq!(third.category(), ErrorCategory::ResourceExhausted);
    assert!(!first.is_completed());
    assert!(!second.is_completed());
    assert_eq!(first.physical_address(), &address);
    assert_ne!(first.correlation_id(), second.correlation_id());

    client.close().await;
    assert!(first.is_completed());
    assert!(second.is_completed());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_submissions_never_exceed_capacity() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let options = support::options()
        .with_max_requests_per_channel(4)
        .with_max_channels_per_endpoint(2)
        .build()
        .expect("合法配置");
    let client = Arc::new(TransportClient::new(options).expect("创建客户端"));
    let address = backend.address();

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let client = Arc::clone(&client);
            let address = address.clone();
            tokio::spawn(async move { client.invoke_store_async(&address, request(b"x")) })
        })
        .collect();
    let mut accepted = Vec::new();
    for task in tasks {
        match task.await.expect("任务完成") {
            Ok(record) => accepted.push(record),
            Err(err) => assert!(err.is_capacity_exceeded(), "实际错误: {err:?}"),
        }
    }
    let endpoint = client.provider().get(&address).expect("端点");
    assert!(accepted.len() <= 8);
    assert_eq!(endpoint.outstanding(), accepted.len());

    // 并发阶段放弃的提交可能留下空位，串行补满后总数恰为上限。
    loop {
        match client.invoke_store_async(&address, request(b"fill")) {
            Ok(record) => accepted.push(record),
            Err(err) => {
                assert!(err.is_capacity_exceeded(), "实际错误: {err:?}");
                break;
            }
        }
    }
    assert_eq!(accepted.len(), 8);
    assert_eq!(endpoint.outstanding(), 8);
    assert_eq!(endpoint.channel_count(), 2);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn responses_are_matched_by_correlation_id() {
    let backend = Backend::spawn(Behavior::Reversed { batch: 4 }).await;
    let options = support::options()
        .with_max_channels_per_endpoint(1)
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");
    let address = backend.address();

    let payloads: [&'static [u8]; 4] = [b"a", b"b", b"c", b"d"];
    let records: Vec<_> = payloads
        .iter()
        .map(|payload| client.invoke_store_async(&address, request(*payload)).expect("提交"))
        .collect();
    for (record, payload) in records.into_iter().zip(payloads) {
        let response = record.await.expect("乱序应答");
        assert_eq!(response.payload().as_ref(), payload);
    }
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stray_correlation_id_is_ignored() {
    let backend = Backend::spawn(Behavior::StrayThenEcho).await;
    let client = TransportClient::new(support::options().build().expect("合法配置"))
        .expect("创建客户端");
    let address = backend.address();

    for _ in 0..3 {
        let response = client.invoke(&address, request(b"ping")).await.expect("应答");
        assert_eq!(response.payload().as_ref(), b"ping");
    }
    let endpoint = client.provider().get(&address).expect("端点");
    assert_eq!(endpoint.channel_count(), 1);
    assert!(endpoint.channels()[0].is_healthy());
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn non_zero_status_surfaces_server_error() {
    let backend = Backend::spawn(Behavior::Reject {
        status: 7,
        message: "no such key",
    })
    .await;
    let client = TransportClient::new(support::options().build().expect("合法配置"))
        .expect("创建客户端");

    let err = client
        .invoke(&backend.address(), request(b"get:missing"))
        .await
        .expect_err("后端拒绝");
    match &err {
        TransportError::Server {
            status, message, ..
        } => {
            assert_eq!(*status, 7);
            assert_eq!(message, "no such key");
        }
        other => panic!("意外错误: {other:?}"),
    }
    assert_eq!(err.category(), ErrorCategory::NonRetryable);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_response_fails_request_but_keeps_channel() {
    for kind in [9u8, 1u8] {
        let backend = Backend::spawn(Behavior::MisKind { kind }).await;
        let client = TransportClient::new(support::options().build().expect("合法配置"))
            .expect("创建客户端");
        let address = backend.address();

        let err = client
            .invoke(&address, request(b"get:garbled"))
            .await
            .expect_err("类型字节非法");
        assert!(
            matches!(
                err,
                TransportError::Decode {
                    correlation_id: Some(_),
                    ..
                }
            ),
            "kind {kind} 实际错误: {err:?}"
        );

        let endpoint = client.provider().get(&address).expect("端点");
        assert_eq!(endpoint.channel_count(), 1);
        assert!(endpoint.channels()[0].is_healthy());
        assert_eq!(endpoint.snapshot().channels_retired, 0);

        let err = client
            .invoke(&address, request(b"get:again"))
            .await
            .expect_err("同一通道上再次失败");
        assert!(matches!(err, TransportError::Decode { .. }));
        assert_eq!(endpoint.snapshot().channels_opened, 1);
        assert_eq!(backend.accepted(), 1);
        client.close().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn receive_hang_retires_channel_but_keeps_endpoint() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let options = support::options()
        .with_receive_hang_detection_time(Duration::from_millis(200))
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");
    let address = backend.address();

    let started = Instant::now();
    let err = client
        .invoke(&address, request(b"get:slow"))
        .await
        .expect_err("应当超时");
    assert!(
        matches!(
            err,
            TransportError::RequestTimeout {
                cause: TimeoutCause::ReceiveHang,
                ..
            }
        ),
        "实际错误: {err:?}"
    );
    assert!(err.is_hang());
    assert!(started.elapsed() < Duration::from_secs(2));

    let endpoint = client.provider().get(&address).expect("端点");
    assert!(
        eventually(Duration::from_secs(1), || endpoint.snapshot().channels_retired == 1).await
    );
    assert_eq!(endpoint.channel_count(), 0);
    assert_eq!(client.endpoint_eviction_count(), 0);
    assert_eq!(client.endpoint_count(), 1);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn send_hang_is_detected_when_peer_stops_reading() {
    const PAYLOAD: usize = 32 * 1024 * 1024;
    let backend = Backend::spawn(Behavior::NoRead).await;
    let options = support::options()
        .with_send_hang_detection_time(Duration::from_millis(300))
        .with_max_buffer_capacity(PAYLOAD + 16)
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");

    let payload = Bytes::from(vec![0x5a; PAYLOAD]);
    let err = client
        .invoke(&backend.address(), StoreRequest::new(payload))
        .await
        .expect_err("应当检测到发送挂起");
    assert!(
        matches!(
            err,
            TransportError::RequestTimeout {
                cause: TimeoutCause::SendHang,
                ..
            }
        ),
        "实际错误: {err:?}"
    );

    let endpoint = client.provider().get(&backend.address()).expect("端点");
    assert!(eventually(Duration::from_secs(1), || endpoint.snapshot().channels_retired == 1).await);
    assert_eq!(endpoint.channel_count(), 0);

    let record = client
        .invoke_store_async(&backend.address(), request(b"after-hang"))
        .expect("退役后可继续提交");
    assert_eq!(endpoint.channel_count(), 1);
    assert_eq!(endpoint.snapshot().channels_opened, 2);
    assert!(endpoint.channels()[0].is_healthy());
    record.cancel(true);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_expiry_keeps_channel_healthy() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let options = support::options()
        .with_request_timeout(Duration::from_millis(150))
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");
    let address = backend.address();

    let err = client
        .invoke(&address, request(b"get:late"))
        .await
        .expect_err("应当超时");
    assert!(
        matches!(
            err,
            TransportError::RequestTimeout {
                cause: TimeoutCause::Deadline,
                ..
            }
        ),
        "实际错误: {err:?}"
    );
    let endpoint = client.provider().get(&address).expect("端点");
    assert_eq!(endpoint.channel_count(), 1);
    assert!(endpoint.channels()[0].is_healthy());
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_fails_stuck_requests_within_shutdown_timeout() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let client = TransportClient::new(support::options().build().expect("合法配置"))
        .expect("创建客户端");
    let address = backend.address();

    let records: Vec<_> = (0..5)
        .map(|_| client.invoke_store_async(&address, request(b"stuck")).expect("提交"))
        .collect();
    assert!(eventually(Duration::from_secs(1), || backend.requests() == 5).await);

    let started = Instant::now();
    client.close().await;
    assert!(started.elapsed() < client.options().shutdown_timeout() + Duration::from_millis(300));

    for record in records {
        let err = record.await.expect_err("关闭后失败");
        assert!(
            matches!(err, TransportError::ChannelClosed { .. }),
            "实际错误: {err:?}"
        );
    }
    assert!(matches!(
        client.invoke_store_async(&address, request(b"late")),
        Err(TransportError::ClientClosed)
    ));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_does_not_expire_draining_requests() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let options = support::options()
        .with_request_timeout(Duration::from_millis(300))
        .with_shutdown_timeout(Duration::from_secs(2))
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");
    let address = backend.address();

    let records: Vec<_> = (0..5)
        .map(|_| client.invoke_store_async(&address, request(b"stuck")).expect("提交"))
        .collect();
    assert!(eventually(Duration::from_millis(200), || backend.requests() == 5).await);

    let started = Instant::now();
    client.close().await;
    assert!(started.elapsed() < Duration::from_secs(2) + Duration::from_millis(300));

    for record in records {
        let err = record.await.expect_err("关闭后失败");
        assert!(
            matches!(err, TransportError::ChannelClosed { .. }),
            "实际错误: {err:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_invoke_future_cancels_request() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let client = TransportClient::new(support::options().build().expect("合法配置"))
        .expect("创建客户端");
    let address = backend.address();

    let result =
        tokio::time::timeout(Duration::from_millis(100), client.invoke(&address, request(b"x")))
            .await;
    assert!(result.is_err());
    let endpoint = client.provider().get(&address).expect("端点");
    assert!(eventually(Duration::from_secs(1), || endpoint.outstanding() == 0).await);

    let record = client.invoke_store_async(&address, request(b"y")).expect("提交");
    assert!(record.cancel(false));
    assert!(record.is_cancelled());
    assert!(matches!(
        record.await,
        Err(TransportError::Cancelled { .. })
    ));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_endpoint_is_evicted_and_counted() {
    let backend = Backend::spawn(Behavior::Echo).await;
    let options = support::options()
        .with_idle_endpoint_timeout(Duration::from_millis(200))
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");

    client
        .invoke(&backend.address(), request(b"ping"))
        .await
        .expect("应答");
    assert_eq!(client.endpoint_count(), 1);
    assert!(eventually(Duration::from_secs(2), || client.endpoint_count() == 0).await);
    assert_eq!(client.endpoint_eviction_count(), 1);

    client
        .invoke(&backend.address(), request(b"again"))
        .await
        .expect("驱逐后重新建立端点");
    assert_eq!(client.endpoint_count(), 1);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn idle_endpoint_eviction_is_logged() {
    let backend = Backend::spawn(Behavior::Echo).await;
    let client = TransportClient::new(
        support::options()
            .with_idle_endpoint_timeout(Duration::from_secs(3600))
            .build()
            .expect("合法配置"),
    )
    .expect("创建客户端");
    client
        .invoke(&backend.address(), request(b"ping"))
        .await
        .expect("应答");
    let endpoint = client.provider().get(&backend.address()).expect("端点");
    assert!(eventually(Duration::from_secs(1), || endpoint.outstanding() == 0).await);

    let evicted = client
        .provider()
        .sweep(Instant::now() + Duration::from_secs(7200));
    assert_eq!(evicted, 1);
    assert!(logs_contain("evicted idle endpoint"));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_sweep_never_evicts_endpoint_with_registered_request() {
    let backend = Backend::spawn(Behavior::Silent).await;
    let options = support::options()
        .with_idle_endpoint_timeout(Duration::from_secs(3600))
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");
    let address = backend.address();

    let record = client
        .invoke_store_async(&address, request(b"pending"))
        .expect("提交");
    assert!(eventually(Duration::from_secs(1), || backend.requests() == 1).await);

    let later = Instant::now() + Duration::from_secs(2 * 3600);
    assert_eq!(client.provider().sweep(later), 0);
    assert!(!record.is_completed());
    assert_eq!(client.endpoint_count(), 1);
    assert_eq!(client.endpoint_eviction_count(), 0);

    record.cancel(true);
    assert_eq!(client.provider().sweep(later), 1);
    assert_eq!(client.endpoint_count(), 0);
    assert_eq!(client.endpoint_eviction_count(), 1);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_channel_is_closed_but_endpoint_survives() {
    let backend = Backend::spawn(Behavior::Echo).await;
    let options = support::options()
        .with_idle_channel_timeout(Duration::from_millis(100))
        .build()
        .expect("合法配置");
    let client = TransportClient::new(options).expect("创建客户端");
    let address = backend.address();

    client.invoke(&address, request(b"ping")).await.expect("应答");
    let endpoint = client.provider().get(&address).expect("端点");
    assert!(eventually(Duration::from_secs(2), || endpoint.channel_count() == 0).await);
    assert_eq!(endpoint.snapshot().channels_idle_evicted, 1);
    assert_eq!(client.endpoint_count(), 1);

    client.invoke(&address, request(b"pong")).await.expect("新通道应答");
    assert_eq!(backend.accepted(), 2);
    client.close().await;
}

/// 前 `failures` 次建连直接失败，之后委托给 TCP 连接器。
struct FlakyConnector {
    failures: AtomicUsize,
    tcp: TcpConnector,
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(
        &self,
        address: &PhysicalAddress,
        options: &Options,
    ) -> Result<BoxedStream, TransportError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::connection_failed(
                address.clone(),
                "connect",
                &std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        self.tcp.connect(address, options).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_is_reported_and_endpoint_recovers() {
    let backend = Backend::spawn(Behavior::Echo).await;
    let connector = Arc::new(FlakyConnector {
        failures: AtomicUsize::new(1),
        tcp: TcpConnector::new(),
    });
    let client = TransportClient::with_connector(
        support::options().build().expect("合法配置"),
        connector,
    )
    .expect("创建客户端");
    let address = backend.address();

    let err = client
        .invoke(&address, request(b"first"))
        .await
        .expect_err("首次建连失败");
    assert!(
        matches!(err, TransportError::ConnectionFailed { .. }),
        "实际错误: {err:?}"
    );
    assert!(err.category().is_retryable());

    let endpoint = client.provider().get(&address).expect("端点");
    assert!(
        eventually(Duration::from_secs(1), || endpoint.snapshot().channels_retired == 1).await
    );
    let response = client.invoke(&address, request(b"second")).await.expect("恢复");
    assert_eq!(response.payload().as_ref(), b"second");
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_uses_certificate_host_name_override() {
    let (server, client_config) = support::tls_pair("store.direct.test");
    let backend = Backend::spawn_with_tls(Behavior::Echo, Some(server)).await;

    let options = support::options()
        .with_certificate_host_name_override(Some("store.direct.test".to_owned()))
        .build()
        .expect("合法配置");
    let client = TransportClient::with_connector(
        options,
        Arc::new(TlsConnector::new(Arc::clone(&client_config))),
    )
    .expect("创建客户端");
    let response = client
        .invoke(&backend.address(), request(b"secure"))
        .await
        .expect("TLS 应答");
    assert_eq!(response.payload().as_ref(), b"secure");
    client.close().await;

    let client = TransportClient::with_connector(
        support::options().build().expect("合法配置"),
        Arc::new(TlsConnector::new(client_config)),
    )
    .expect("创建客户端");
    let err = client
        .invoke(&backend.address(), request(b"secure"))
        .await
        .expect_err("证书不覆盖 IP 地址，握手应失败");
    assert!(
        matches!(err, TransportError::ConnectionFailed { .. }),
        "实际错误: {err:?}"
    );
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn diagnostics_report_endpoint_activity() {
    let backend = Backend::spawn(Behavior::Echo).await;
    let client = TransportClient::new(support::options().build().expect("合法配置"))
        .expect("创建客户端");
    let address = backend.address();
    client.invoke(&address, request(b"one")).await.expect("应答");
    client.invoke(&address, request(b"two")).await.expect("应答");

    let snapshot = client.diagnostics();
    assert_eq!(snapshot.id, client.id());
    assert_eq!(snapshot.endpoint_count, 1);
    assert_eq!(snapshot.endpoints[0].requests_accepted, 2);
    assert!(
        eventually(Duration::from_secs(1), || {
            client.diagnostics().endpoints[0].responses == 2
        })
        .await
    );

    let json: serde_json::Value =
        serde_json::from_str(&client.diagnostics_json().expect("序列化诊断")).expect("合法 JSON");
    assert_eq!(json["endpoint_count"], 1);
    assert_eq!(json["endpoints"][0]["channels"][0]["state"], "open");
    assert_eq!(json["closed"], false);
    client.close().await;
    assert!(client.diagnostics().closed);
}

#[test]
fn client_requires_tokio_runtime() {
    let err = TransportClient::new(Options::default()).expect_err("运行时之外无法创建");
    assert!(matches!(err, TransportError::RuntimeUnavailable { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn client_loads_options_from_toml() {
    let client = TransportClient::from_toml("request_timeout_ms = 250\nmax_requests_per_channel = 4\n")
        .expect("合法配置");
    assert_eq!(client.options().request_timeout(), Duration::from_millis(250));
    assert_eq!(client.options().max_requests_per_channel(), 4);

    let err = TransportClient::from_toml("max_requests_per_channel = 0\n")
        .expect_err("零容量被拒绝");
    assert!(matches!(err, TransportError::Config(_)));
    assert_eq!(err.code(), "spark.direct.invalid_options");

    let err = TransportClient::from_toml("request_timeout_ms = \"soon\"\n").expect_err("类型错误");
    assert!(matches!(
        err,
        TransportError::Config(spark_direct_core::ConfigError::Parse { .. })
    ));
    client.close().await;
}
