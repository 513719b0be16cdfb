//! 通道计时任务：截止时间、挂起检测与空闲驱逐。
//!
//! - 截止时间到期只让该请求以 `RequestTimeout(Deadline)` 失败，连接仍视为健康；
//! - 发送挂起：请求尚未写完，且自 `max(创建时刻, 通道最近写出进展)` 起超过
//!   `send_hang_detection_time` 没有进展；
//! - 接收挂起：请求已写完，且自 `max(写完时刻, 通道最近读入)` 起超过
//!   `receive_hang_detection_time` 没有读到任何字节；
//! - 任一挂起都让命中的请求以对应原因超时，并退役整条通道；
//! - `Draining` 期间不做任何到期判定，剩余请求交给强制关闭以 `ChannelClosed` 结束；
//! - 空闲驱逐先以空闲占位锁住容量计数，再关闭通道，不会与并发的 `send` 交错。

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use spark_direct_core::{ChannelState, RequestRecord, TimeoutCause, TransportError};
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelInner, Retirement};
use crate::util::TaskGuard;

pub(crate) async fn run_timer(inner: Arc<ChannelInner>, _guard: TaskGuard) {
    let mut ticker = tokio::time::interval(inner.options.timer_resolution());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.wait() => return,
            _ = ticker.tick() => {}
        }
        if !on_tick(&inner, Instant::now()) {
            return;
        }
    }
}

/// 执行一次检查；返回 `false` 表示通道已关闭，计时任务应当退出。
pub(crate) fn on_tick(inner: &ChannelInner, now: Instant) -> bool {
    let state = inner.state();
    if state == ChannelState::Closed {
        return false;
    }
    if state == ChannelState::Draining {
        return true;
    }

    let mut hang = None;
    for record in inner.outstanding_records() {
        if now >= record.deadline() {
            expire(inner, &record, TimeoutCause::Deadline);
            continue;
        }
        if state == ChannelState::Connecting {
            continue;
        }
        if let Some(cause) = hang_cause(inner, &record, now) {
            expire(inner, &record, cause);
            hang.get_or_insert(cause);
        }
    }
    if let Some(cause) = hang {
        inner.retire_hung(cause);
        return false;
    }

    if let Some(idle_timeout) = inner.options.idle_channel_timeout()
        && state.accepts_requests()
        && inner.progress.idle_for(now) >= idle_timeout
        && inner.try_claim_idle()
    {
        inner.close(Cow::Borrowed("idle timeout"), Retirement::Idle);
        return false;
    }
    true
}

fn hang_cause(inner: &ChannelInner, record: &RequestRecord, now: Instant) -> Option<TimeoutCause> {
    match record.flushed_at() {
        None => {
            let since = record.created_at().max(inner.progress.last_write());
            (now.saturating_duration_since(since) >= inner.options.send_hang_detection_time())
                .then_some(TimeoutCause::SendHang)
        }
        Some(flushed_at) => {
            let since = flushed_at.max(inner.progress.last_read());
            (now.saturating_duration_since(since) >= inner.options.receive_hang_detection_time())
                .then_some(TimeoutCause::ReceiveHang)
        }
    }
}

fn expire(inner: &ChannelInner, record: &RequestRecord, cause: TimeoutCause) {
    record.complete_exceptionally(TransportError::RequestTimeout {
        address: inner.address.clone(),
        correlation_id: record.correlation_id(),
        cause,
        elapsed: record.elapsed(),
    });
}
