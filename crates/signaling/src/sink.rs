//! 出站消息通道
//!
//! 每个会话持有一个 [`MessageSink`]，中继只通过它向客户端推送已编码的帧，
//! 不关心底层是 WebSocket、HTTP 长轮询还是测试里的内存队列。

use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// 对端已经不可达
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbound channel closed")]
pub struct ChannelClosed;

/// 面向单个客户端的出站通道
pub trait MessageSink: Send + Sync + fmt::Debug {
    /// 投递一帧，不等待对端确认
    fn send(&self, frame: Bytes) -> Result<(), ChannelClosed>;

    /// 通道是否已经关闭
    fn is_closed(&self) -> bool;
}

/// 基于 unbounded mpsc 的出站通道
///
/// 传输层持有接收端并把帧写到 socket，接收端被 drop 后 `send` 返回 [`ChannelClosed`]。
#[derive(Debug, Clone)]
pub struct ChannelSink {
    direct_sender: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (direct_sender, rx) = mpsc::unbounded_channel();
        (Self { direct_sender }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, frame: Bytes) -> Result<(), ChannelClosed> {
        self.direct_sender.send(frame).map_err(|_| ChannelClosed)
    }

    fn is_closed(&self) -> bool {
        self.direct_sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.send(Bytes::from_static(b"one")).unwrap();
        sink.send(Bytes::from_static(b"two")).unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);

        assert!(sink.is_closed());
        assert_eq!(sink.send(Bytes::from_static(b"late")), Err(ChannelClosed));
    }
}
