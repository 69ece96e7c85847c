//! Prometheus 监控指标模块
//!
//! 提供全局指标收集和导出功能

use crate::BaseError;
use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

static METRICS_INIT: Once = Once::new();

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========== 状态指标 ==========

    /// 当前存活的会话数
    pub static ref ACTIVE_SESSIONS: IntGauge = IntGauge::new(
        "roomrelay_active_sessions",
        "Number of registered signaling sessions"
    ).unwrap();

    /// 当前存在的房间数（至少一个成员）
    pub static ref ACTIVE_ROOMS: IntGauge = IntGauge::new(
        "roomrelay_active_rooms",
        "Number of rooms with at least one member"
    ).unwrap();

    /// WebSocket 连接数
    pub static ref WEBSOCKET_CONNECTIONS: IntGauge = IntGauge::new(
        "roomrelay_websocket_connections",
        "Number of active WebSocket connections"
    ).unwrap();

    /// SSE 事件流连接数
    pub static ref EVENT_STREAM_CONNECTIONS: IntGauge = IntGauge::new(
        "roomrelay_event_stream_connections",
        "Number of active server-sent event streams"
    ).unwrap();

    // ========== 流量指标 ==========

    /// 已路由的信令消息（按类型）
    pub static ref MESSAGES_ROUTED: IntCounterVec = IntCounterVec::new(
        Opts::new("messages_routed_total", "Total number of signaling messages routed")
            .namespace("roomrelay"),
        &["type"]
    ).unwrap();

    /// 返回给发送方的错误（按错误类型）
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("errors_total", "Total number of errors returned to senders")
            .namespace("roomrelay"),
        &["kind"]
    ).unwrap();

    /// 会话回收次数（按原因）
    pub static ref EVICTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("evictions_total", "Total number of sessions evicted by the supervisor")
            .namespace("roomrelay"),
        &["reason"]
    ).unwrap();

    /// 速率限制触发次数
    pub static ref RATE_LIMIT_EXCEEDED: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limit_exceeded_total", "Total number of rate limit violations")
            .namespace("roomrelay"),
        &["limiter_type"]
    ).unwrap();
}

/// 注册所有指标到全局 Registry
///
/// This function is idempotent - calling it multiple times is safe.
/// Only the first call will actually register the metrics.
pub fn register_metrics() -> crate::Result<()> {
    let mut result = Ok(());

    METRICS_INIT.call_once(|| {
        let register_result = (|| {
            REGISTRY.register(Box::new(ACTIVE_SESSIONS.clone()))?;
            REGISTRY.register(Box::new(ACTIVE_ROOMS.clone()))?;
            REGISTRY.register(Box::new(WEBSOCKET_CONNECTIONS.clone()))?;
            REGISTRY.register(Box::new(EVENT_STREAM_CONNECTIONS.clone()))?;

            REGISTRY.register(Box::new(MESSAGES_ROUTED.clone()))?;
            REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;
            REGISTRY.register(Box::new(EVICTIONS_TOTAL.clone()))?;
            REGISTRY.register(Box::new(RATE_LIMIT_EXCEEDED.clone()))?;

            Ok::<(), prometheus::Error>(())
        })();

        if let Err(e) = register_result {
            result = Err(BaseError::Metrics(e));
        }
    });

    result
}

/// 导出 Prometheus 格式的指标
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8_lossy(&buffer).into_owned()
}
