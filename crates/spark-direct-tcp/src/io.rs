//! 通道的读写任务。
//!
//! 写任务先建连，再串行写出排队的帧；读任务按页读入字节、解帧并按关联 ID 分发。
//! 两者都优先响应关闭信号。

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use spark_direct_core::{
    FRAME_HEADER_LEN, Frame, FrameDecoder, FrameError, FrameKind, RequestRecord, StoreResponse,
    TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, trace};

use crate::channel::{ChannelInner, Retirement};
use crate::connector::{BoxedStream, Connector};
use crate::error::{self, close_reason};
use crate::util::{TaskGuard, run_with_deadline};

/// 写队列中的一项：已登记的记录与编码好的帧。
pub(crate) struct PendingWrite {
    pub(crate) record: RequestRecord,
    pub(crate) frame: Bytes,
}

enum WriteAbort {
    Shutdown,
    Io(std::io::Error),
}

pub(crate) async fn run_writer(
    inner: Arc<ChannelInner>,
    connector: Arc<dyn Connector>,
    mut queue: mpsc::UnboundedReceiver<PendingWrite>,
    runtime: Handle,
    _guard: TaskGuard,
) {
    let connect = connector.connect(&inner.address, &inner.options);
    let stream = match run_with_deadline(
        error::CONNECT,
        &inner.address,
        inner.options.connection_timeout(),
        &inner.shutdown,
        connect,
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            inner.fail_connect(error);
            return;
        }
    };

    let (reader, mut writer) = tokio::io::split(stream);
    if !inner.mark_open() {
        return;
    }
    let reader_guard = inner.tasks.enter();
    runtime.spawn(run_reader(Arc::clone(&inner), reader, reader_guard).in_current_span());

    loop {
        let pending = tokio::select! {
            biased;
            _ = inner.shutdown.wait() => break,
            next = queue.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };
        if !pending.record.should_write() {
            trace!(
                correlation_id = pending.record.correlation_id(),
                "skipping write for completed request"
            );
            continue;
        }
        match write_frame(&inner, &mut writer, &pending).await {
            Ok(()) => {}
            Err(WriteAbort::Shutdown) => break,
            Err(WriteAbort::Io(err)) => {
                debug!(code = error::WRITE.code, error = %err, "write failed");
                inner.close(close_reason(error::WRITE, &err), Retirement::Failed);
                break;
            }
        }
    }

    match tokio::time::timeout(inner.options.shutdown_timeout(), writer.shutdown()).await {
        Ok(Ok(())) => trace!("write half closed"),
        Ok(Err(err)) => debug!(code = error::SHUTDOWN.code, error = %err, "write half shutdown failed"),
        Err(_) => debug!(code = error::SHUTDOWN.code, "write half shutdown timed out"),
    }
}

/// 分页写出一个帧，每页记录一次写出进展，供挂起检测使用。
async fn write_frame(
    inner: &ChannelInner,
    writer: &mut WriteHalf<BoxedStream>,
    pending: &PendingWrite,
) -> Result<(), WriteAbort> {
    let record = &pending.record;
    let now = Instant::now();
    record.mark_send_started(now);
    inner.progress.touch_write(now);

    for chunk in pending.frame.chunks(inner.options.buffer_page_size()) {
        tokio::select! {
            biased;
            _ = inner.shutdown.wait() => return Err(WriteAbort::Shutdown),
            result = writer.write_all(chunk) => result.map_err(WriteAbort::Io)?,
        }
        let now = Instant::now();
        record.record_send_progress(now);
        inner.progress.touch_write(now);
        inner
            .bytes_written
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    tokio::select! {
        biased;
        _ = inner.shutdown.wait() => return Err(WriteAbort::Shutdown),
        result = writer.flush() => result.map_err(WriteAbort::Io)?,
    }

    let now = Instant::now();
    record.mark_flushed(now);
    inner.progress.touch_write(now);
    inner.requests_sent.fetch_add(1, Ordering::Relaxed);
    trace!(correlation_id = record.correlation_id(), "request flushed");
    Ok(())
}

pub(crate) async fn run_reader(
    inner: Arc<ChannelInner>,
    mut reader: ReadHalf<BoxedStream>,
    _guard: TaskGuard,
) {
    let page = inner.options.buffer_page_size();
    let mut decoder = FrameDecoder::new(inner.options.max_buffer_capacity());
    let mut buffer = BytesMut::with_capacity(page);
    let mut scratch = vec![0u8; page];

    loop {
        let read = tokio::select! {
            biased;
            _ = inner.shutdown.wait() => return,
            read = reader.read(&mut scratch) => read,
        };
        match read {
            Ok(0) => {
                inner.close(
                    std::borrow::Cow::Borrowed("connection closed by peer"),
                    Retirement::Failed,
                );
                return;
            }
            Ok(read) => {
                let now = Instant::now();
                inner.progress.touch_read(now);
                inner.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
                buffer.extend_from_slice(&scratch[..read]);
                if !drain_frames(&inner, &mut decoder, &mut buffer, now) {
                    return;
                }
                // 半个大帧：一次性预留剩余字节，避免按页反复扩容。
                let missing = decoder.missing(&buffer).min(decoder.max_frame_len());
                if missing > page {
                    buffer.reserve(missing);
                }
            }
            Err(err) => {
                debug!(code = error::READ.code, error = %err, "read failed");
                inner.close(close_reason(error::READ, &err), Retirement::Failed);
                return;
            }
        }
    }
}

/// 解出缓冲中的全部完整帧；遇到致命错误时关闭通道并返回 `false`。
fn drain_frames(
    inner: &ChannelInner,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
    now: Instant,
) -> bool {
    loop {
        match decoder.decode(buffer) {
            Ok(Some(frame)) => dispatch(inner, frame, now),
            Ok(None) => {
                if buffer.len() >= FRAME_HEADER_LEN {
                    let mut id = [0u8; 8];
                    id.copy_from_slice(&buffer[8..16]);
                    if let Some(record) = inner.record(u64::from_le_bytes(id)) {
                        record.record_receive_progress(now);
                    }
                }
                return true;
            }
            Err(err) if err.is_fatal() => {
                inner.close(
                    std::borrow::Cow::Owned(format!("protocol violation: {err}")),
                    Retirement::Failed,
                );
                return false;
            }
            Err(err) => fail_correlated(inner, err),
        }
    }
}

fn dispatch(inner: &ChannelInner, frame: Frame, now: Instant) {
    if frame.kind() != FrameKind::Response {
        fail_correlated(
            inner,
            FrameError::UnexpectedKind {
                kind: frame.kind(),
                correlation_id: frame.correlation_id(),
            },
        );
        return;
    }

    let correlation_id = frame.correlation_id();
    let Some(record) = inner.record(correlation_id) else {
        debug!(correlation_id, "dropping response for unknown correlation id");
        return;
    };
    record.record_receive_progress(now);
    let status = frame.status();
    if status == 0 {
        record.complete(StoreResponse::new(
            correlation_id,
            status,
            frame.into_payload(),
        ));
    } else {
        let message = String::from_utf8_lossy(frame.payload()).into_owned();
        record.complete_exceptionally(TransportError::Server {
            address: inner.address.clone(),
            correlation_id,
            status,
            message,
        });
    }
}

/// 非致命解码错误：能定位到记录时让该记录失败，否则仅记录日志。
fn fail_correlated(inner: &ChannelInner, err: FrameError) {
    let correlation_id = err.correlation_id();
    debug!(?correlation_id, error = %err, "undecodable frame");
    if let Some(record) = correlation_id.and_then(|id| inner.record(id)) {
        record.complete_exceptionally(TransportError::Decode {
            address: inner.address.clone(),
            correlation_id,
            detail: err.to_string(),
        });
    }
}
