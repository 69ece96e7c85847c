//! SSE 事件流传输
//!
//! 无法使用 WebSocket 的客户端通过 `GET /events` 打开一条 server-sent events 流接收信令，
//! 再通过 `POST /rooms/{room_id}/signal` 发送。流上的第一个事件是 welcome，
//! 其中的 `sessionId` 就是后续请求携带的 `x-session-id`。
//!
//! 流被客户端关闭时会话随之清理；会话被回收时出站通道关闭，流也随之结束。

use crate::error::SignalingError;
use crate::ratelimit::ConnectionPermit;
use crate::server::SignalingServer;
use crate::session::SessionId;
use crate::sink::{ChannelClosed, MessageSink};
use axum::response::sse::Event;
use bytes::Bytes;
use futures_util::Stream;
use relay_common::metrics::EVENT_STREAM_CONNECTIONS;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

/// 把每一帧转换为一个 SSE 事件的出站通道
#[derive(Debug, Clone)]
pub struct EventStreamSink {
    events: mpsc::UnboundedSender<Event>,
}

impl EventStreamSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

impl MessageSink for EventStreamSink {
    fn send(&self, frame: Bytes) -> Result<(), ChannelClosed> {
        // 帧是单行 JSON，整帧作为 data
        let event = Event::default().data(String::from_utf8_lossy(&frame));
        self.events.send(event).map_err(|_| ChannelClosed)
    }

    fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// 随响应流一起存活，drop 时清理会话并归还连接名额
struct EventStreamGuard {
    server: SignalingServer,
    session_id: SessionId,
    _permit: ConnectionPermit,
}

impl Drop for EventStreamGuard {
    fn drop(&mut self) {
        EVENT_STREAM_CONNECTIONS.dec();
        info!("🔌 SSE 客户端 {} 已断开连接", self.session_id);

        let server = self.server.clone();
        let session_id = self.session_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    server.release_session(&session_id).await;
                });
            }
            Err(_) => warn!("运行时不可用，跳过会话 {} 的清理", session_id),
        }
    }
}

/// 注册一个以 SSE 接收消息的会话
///
/// 返回的流以 welcome 事件开头。
pub async fn open_event_stream(
    server: SignalingServer,
    permit: ConnectionPermit,
) -> Result<(SessionId, impl Stream<Item = Result<Event, Infallible>>), SignalingError> {
    let (sink, events) = EventStreamSink::new();
    let session_id = server.relay.connect(Arc::new(sink)).await?;

    EVENT_STREAM_CONNECTIONS.inc();
    info!(
        "🔗 新 SSE 客户端连接: {} (IP: {})",
        session_id,
        permit.ip()
    );

    let guard = EventStreamGuard {
        server,
        session_id: session_id.clone(),
        _permit: permit,
    };
    let stream = UnboundedReceiverStream::new(events).map(move |event| {
        let _alive = &guard;
        Ok::<_, Infallible>(event)
    });

    Ok((session_id, stream))
}
