//! WebSocket 信令服务器
//!
//! 每个 WebSocket 连接对应一个会话：连接建立时注册并发送 welcome，
//! 读任务把文本帧交给 [`Relay::on_message`]，写任务把会话出站通道中的帧写回 socket，
//! 任一方向结束后通过 [`Relay::on_close`] 清理。

use crate::error::SignalingError;
use crate::ratelimit::{ConnectionPermit, ConnectionRateLimiter, MessageRateLimiter};
use crate::relay::Relay;
use crate::session::SessionId;
use crate::sink::ChannelSink;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use relay_common::config::signaling::SignalingConfig;
use relay_common::metrics::WEBSOCKET_CONNECTIONS;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

/// 信令服务器状态
#[derive(Debug, Clone)]
pub struct SignalingServer {
    pub relay: Arc<Relay>,
    pub config: Arc<SignalingConfig>,
    /// 连接速率限制器
    pub connection_rate_limiter: Option<Arc<ConnectionRateLimiter>>,
    /// 消息速率限制器
    pub message_rate_limiter: Option<Arc<MessageRateLimiter>>,
}

impl SignalingServer {
    /// 按配置创建服务器并启动中继
    pub fn new(config: SignalingConfig) -> Self {
        let rate_limit = &config.rate_limit;

        let connection_rate_limiter = if rate_limit.connection.enabled {
            info!(
                "Initializing connection rate limiter: {}/min, burst: {}, max concurrent: {}/IP",
                rate_limit.connection.per_minute,
                rate_limit.connection.burst_size,
                rate_limit.connection.max_concurrent_per_ip
            );
            Some(Arc::new(ConnectionRateLimiter::new(
                rate_limit.connection.clone(),
            )))
        } else {
            info!("⚠️  Connection rate limiting is disabled");
            None
        };

        let message_rate_limiter = if rate_limit.message.enabled {
            info!(
                "Initializing message rate limiter: {}/sec, burst: {}",
                rate_limit.message.per_second, rate_limit.message.burst_size
            );
            Some(Arc::new(MessageRateLimiter::new(rate_limit.message.clone())))
        } else {
            info!("⚠️  Message rate limiting is disabled");
            None
        };

        Self {
            relay: Relay::start(&config, connection_rate_limiter.clone()),
            config: Arc::new(config),
            connection_rate_limiter,
            message_rate_limiter,
        }
    }

    /// 为来自 `ip` 的新连接申请许可，许可 drop 时归还并发名额
    pub async fn acquire_connection(&self, ip: IpAddr) -> Result<ConnectionPermit, SignalingError> {
        match &self.connection_rate_limiter {
            Some(limiter) => limiter.acquire(ip).await,
            None => Ok(ConnectionPermit::unlimited(ip)),
        }
    }

    /// 会话结束时清理中继与限流状态
    pub async fn release_session(&self, session_id: &SessionId) {
        self.relay.on_close(session_id).await;
        if let Some(limiter) = &self.message_rate_limiter {
            limiter.remove_session(session_id).await;
        }
    }

    /// 检查会话的消息速率
    pub async fn check_message_rate(&self, session_id: &SessionId) -> Result<(), SignalingError> {
        match &self.message_rate_limiter {
            Some(limiter) => limiter.check_message(session_id).await,
            None => Ok(()),
        }
    }
}

/// 处理一个 WebSocket 连接直到断开
pub async fn handle_websocket_connection(
    websocket: WebSocket,
    server: SignalingServer,
    client_ip: Option<IpAddr>,
) -> Result<(), SignalingError> {
    // 分离读写流
    let (mut ws_sender, mut ws_receiver) = websocket.split();

    // 会话的出站通道，写任务持有接收端
    let (sink, mut direct_rx) = ChannelSink::new();
    let session_id = server.relay.connect(Arc::new(sink)).await?;

    WEBSOCKET_CONNECTIONS.inc();
    info!(
        "🔗 新 WebSocket 客户端连接: {} (IP: {:?})",
        session_id, client_ip
    );

    // 处理客户端消息的任务
    let server_for_receive = server.clone();
    let session_for_receive = session_id.clone();
    let span = info_span!("signaling.connection", session_id = %session_id);

    let mut receive_task = tokio::spawn(
        async move {
            while let Some(msg) = ws_receiver.next().await {
                let frame = match msg {
                    Ok(WsMessage::Text(text)) => text.as_str().as_bytes().to_vec(),
                    Ok(WsMessage::Binary(data)) => data.to_vec(),
                    Ok(WsMessage::Close(_)) => {
                        info!("客户端 {} 主动断开连接", session_for_receive);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket 错误: {}", e);
                        break;
                    }
                };

                handle_client_frame(&frame, &session_for_receive, &server_for_receive).await;
            }
        }
        .instrument(span),
    );

    // 处理发送消息的任务
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = direct_rx.recv().await {
            let text = String::from_utf8_lossy(&frame).into_owned();
            if ws_sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        // 会话被回收后通道关闭，通知客户端
        let _ = ws_sender.send(WsMessage::Close(None)).await;
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut receive_task => send_task.abort(),
        _ = &mut send_task => receive_task.abort(),
    }

    // 清理会话
    server.release_session(&session_id).await;
    WEBSOCKET_CONNECTIONS.dec();
    info!("🔌 客户端 {} 已断开连接", session_id);

    Ok(())
}

/// 处理客户端发送的一帧
async fn handle_client_frame(frame: &[u8], session_id: &SessionId, server: &SignalingServer) {
    // 检查消息速率限制
    if let Err(e) = server.check_message_rate(session_id).await {
        warn!("🚫 会话 {} 消息速率限制触发", session_id);
        server.relay.router().reject(session_id, &e).await;
        return;
    }

    match server.relay.on_message(session_id, frame).await {
        Ok(()) => debug!("📨 已处理来自 {} 的信令消息", session_id),
        Err(SignalingError::Validation(reason)) => {
            debug!("会话 {} 发送了无效消息: {}", session_id, reason)
        }
        Err(e) => debug!("会话 {} 的请求被拒绝: {}", session_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_respects_disabled_limits() {
        let mut config = SignalingConfig::default();
        config.rate_limit.connection.enabled = false;
        config.rate_limit.message.enabled = false;

        let server = SignalingServer::new(config);
        assert!(server.connection_rate_limiter.is_none());
        assert!(server.message_rate_limiter.is_none());
        assert!(
            server
                .check_message_rate(&SessionId::from("anyone"))
                .await
                .is_ok()
        );

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let permits: Vec<_> = futures_util::future::join_all(
            (0..50).map(|_| server.acquire_connection(ip)),
        )
        .await;
        assert!(permits.iter().all(Result::is_ok));

        server.relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_builds_limiters_from_config() {
        let server = SignalingServer::new(SignalingConfig::default());
        assert!(server.connection_rate_limiter.is_some());
        assert!(server.message_rate_limiter.is_some());

        server.relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_permits_respect_per_ip_cap() {
        let mut config = SignalingConfig::default();
        config.rate_limit.connection.max_concurrent_per_ip = 1;
        let server = SignalingServer::new(config);
        let ip: IpAddr = "10.0.0.2".parse().unwrap();

        let permit = server.acquire_connection(ip).await.unwrap();
        assert!(server.acquire_connection(ip).await.is_err());

        drop(permit);
        assert!(server.acquire_connection(ip).await.is_ok());

        server.relay.shutdown().await;
    }
}
