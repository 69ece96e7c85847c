//! 信令路由
//!
//! 每个会话只有两种状态：未加入（`Unjoined`）和在房间中（`InRoom`）。
//! 路由器校验成员关系后把 offer / answer / ice-candidate 原样转发给目标，
//! 并在加入、离开时向房间其他成员广播房间事件。

use crate::error::SignalingError;
use crate::message::{Relayed, RoomEventKind, SignalingMessage};
use crate::registry::RoomRegistry;
use crate::session::{SessionId, SessionManager};
use relay_common::metrics::{ERRORS_TOTAL, MESSAGES_ROUTED};
use std::sync::Arc;
use strum::AsRefStr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 房间 ID 最大长度（字符）
pub const MAX_ROOM_ID_LEN: usize = 128;

/// 会话被回收的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EvictionReason {
    /// 出站通道已关闭
    ChannelClosed,
    /// 传输层断开
    Disconnected,
    IdleTimeout,
    /// 注册表与会话状态不一致
    InvariantViolation,
    Shutdown,
}

/// 发给 Supervisor 的回收请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub session_id: SessionId,
    pub reason: EvictionReason,
}

/// 信令路由器
#[derive(Debug)]
pub struct SignalingRouter {
    sessions: Arc<SessionManager>,
    registry: Arc<RoomRegistry>,
    evictions: mpsc::UnboundedSender<Eviction>,
}

impl SignalingRouter {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<RoomRegistry>,
        evictions: mpsc::UnboundedSender<Eviction>,
    ) -> Self {
        Self {
            sessions,
            registry,
            evictions,
        }
    }

    /// 处理一条来自 `sender` 的客户端消息
    pub async fn route(
        &self,
        sender: &SessionId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        self.sessions.touch(sender).await?;
        let message_type = message.message_type();

        let result = match message {
            SignalingMessage::Join {
                room_id,
                display_name,
            } => self.join(sender, &room_id, display_name).await.map(|_| ()),
            SignalingMessage::Leave => self.leave(sender).await.map(|_| ()),
            SignalingMessage::Offer(relayed) => {
                let target = relayed.target.clone();
                self.forward(sender, &target, SignalingMessage::Offer(relayed))
                    .await
            }
            SignalingMessage::Answer(relayed) => {
                let target = relayed.target.clone();
                self.forward(sender, &target, SignalingMessage::Answer(relayed))
                    .await
            }
            SignalingMessage::IceCandidate(relayed) => {
                let target = relayed.target.clone();
                self.forward(sender, &target, SignalingMessage::IceCandidate(relayed))
                    .await
            }
            SignalingMessage::Ping => self.reply(sender, &SignalingMessage::Pong).await,
            other => Err(SignalingError::validation(format!(
                "'{}' messages are generated by the server",
                other.message_type()
            ))),
        };

        if result.is_ok() {
            MESSAGES_ROUTED
                .with_label_values(&[message_type.as_ref()])
                .inc();
        }
        result
    }

    /// 加入房间，返回加入时房间内的其他成员
    pub async fn join(
        &self,
        sender: &SessionId,
        room_id: &str,
        display_name: Option<String>,
    ) -> Result<Vec<SessionId>, SignalingError> {
        validate_room_id(room_id)?;

        let session = self.sessions.get(sender).await?;
        let _transition = session.lock_transition().await;
        if session.is_closed().await {
            return Err(SignalingError::session_not_found(sender));
        }
        if let Some(current) = session.room_id().await {
            return Err(SignalingError::AlreadyInRoom { room_id: current });
        }

        // 先写注册表，再写会话；会话写入失败时回滚注册表
        let members = self.registry.add_member(room_id, sender).await?;
        if let Err(e) = self.sessions.attach_room(sender, room_id).await {
            if let Err(rollback) = self.registry.remove_member(room_id, sender).await {
                error!(
                    "❗ 回滚房间 {} 的成员 {} 失败: {}",
                    room_id, sender, rollback
                );
            }
            return Err(e);
        }
        self.sessions
            .set_display_name(sender, display_name.clone())
            .await?;

        let peers: Vec<SessionId> = members.into_iter().filter(|m| m != sender).collect();
        info!(
            "🚪 会话 {} 加入房间 {} (其他成员: {})",
            sender,
            room_id,
            peers.len()
        );

        self.deliver(
            sender,
            &SignalingMessage::Joined {
                room_id: room_id.to_string(),
                members: peers.clone(),
            },
        )
        .await;

        let event = SignalingMessage::RoomEvent {
            kind: RoomEventKind::PeerJoined,
            session_id: sender.clone(),
            display_name,
        };
        self.fan_out(&peers, &event).await;

        Ok(peers)
    }

    /// 离开当前房间，返回离开的房间；未加入任何房间时什么也不做
    pub async fn leave(&self, sender: &SessionId) -> Result<Option<String>, SignalingError> {
        let session = self.sessions.get(sender).await?;
        let _transition = session.lock_transition().await;

        let Some(room_id) = session.room_id().await else {
            debug!("会话 {} 不在任何房间中，忽略 leave", sender);
            return Ok(None);
        };

        let remaining = match self.registry.remove_member(&room_id, sender).await {
            Ok(remaining) => remaining,
            Err(e) => {
                error!(
                    "❗ 会话 {} 认为自己在房间 {} 中，但注册表不一致: {}",
                    sender, room_id, e
                );
                self.sessions.detach_room(sender).await?;
                self.request_eviction(sender.clone(), EvictionReason::InvariantViolation);
                return Ok(Some(room_id));
            }
        };
        self.sessions.detach_room(sender).await?;

        info!(
            "🚶 会话 {} 离开房间 {} (剩余成员: {})",
            sender,
            room_id,
            remaining.len()
        );

        let event = SignalingMessage::RoomEvent {
            kind: RoomEventKind::PeerLeft,
            session_id: sender.clone(),
            display_name: session.display_name().await,
        };
        self.fan_out(&remaining, &event).await;

        Ok(Some(room_id))
    }

    /// 注销会话并向原房间的剩余成员广播 peer-left
    ///
    /// 成员移除与会话删除在同一次迁移锁持有内完成，广播使用当时的剩余成员快照。
    /// 返回是否真的移除了会话；对已移除的会话是空操作。
    pub async fn evict(&self, session_id: &SessionId) -> bool {
        let Some(removed) = self.sessions.unregister(session_id).await else {
            return false;
        };

        if let Some(departure) = removed.departed {
            info!(
                "🚶 会话 {} 被移出房间 {} (剩余成员: {})",
                session_id,
                departure.room_id,
                departure.remaining.len()
            );
            let event = SignalingMessage::RoomEvent {
                kind: RoomEventKind::PeerLeft,
                session_id: session_id.clone(),
                display_name: removed.session.display_name().await,
            };
            self.fan_out(&departure.remaining, &event).await;
        }
        true
    }

    /// 把点对点消息转发给同房间的目标
    async fn forward(
        &self,
        sender: &SessionId,
        target: &SessionId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        let Some(room_id) = self.sessions.room_of(sender).await? else {
            return Err(SignalingError::NotInRoom);
        };

        if target == sender {
            return Err(SignalingError::validation(
                "a session cannot signal itself",
            ));
        }

        if !self.registry.is_member(&room_id, target).await {
            return Err(SignalingError::UnknownTarget {
                target: target.clone(),
                room_id,
            });
        }

        match self.sessions.send(target, &message, Some(sender)).await {
            Ok(()) => {
                debug!(
                    "📤 {} {} -> {} (房间 {})",
                    message.message_type(),
                    sender,
                    target,
                    room_id
                );
                Ok(())
            }
            Err(SignalingError::ChannelClosed(closed)) => {
                warn!("目标 {} 的通道已关闭，安排回收", closed);
                self.request_eviction(closed.clone(), EvictionReason::ChannelClosed);
                Err(SignalingError::ChannelClosed(closed))
            }
            // 目标在校验之后被并发移除
            Err(SignalingError::NotFound { .. }) => Err(SignalingError::UnknownTarget {
                target: target.clone(),
                room_id,
            }),
            Err(e) => Err(e),
        }
    }

    /// 回复请求方本身
    async fn reply(
        &self,
        sender: &SessionId,
        message: &SignalingMessage,
    ) -> Result<(), SignalingError> {
        let result = self.sessions.send(sender, message, None).await;
        if let Err(SignalingError::ChannelClosed(closed)) = &result {
            self.request_eviction(closed.clone(), EvictionReason::ChannelClosed);
        }
        result
    }

    /// 向请求方报告错误（不会广播给其他成员）
    pub async fn reject(&self, sender: &SessionId, err: &SignalingError) {
        ERRORS_TOTAL.with_label_values(&[err.kind().as_ref()]).inc();
        debug!("⚠️ 拒绝会话 {} 的请求: {}", sender, err);
        self.deliver(sender, &SignalingMessage::error(err)).await;
    }

    /// 投递一条服务端消息，失败只记录日志
    async fn deliver(&self, recipient: &SessionId, message: &SignalingMessage) {
        match self.sessions.send(recipient, message, None).await {
            Ok(()) => {}
            Err(SignalingError::ChannelClosed(closed)) => {
                warn!("会话 {} 的通道已关闭，安排回收", closed);
                self.request_eviction(closed, EvictionReason::ChannelClosed);
            }
            Err(e) => debug!("跳过投递给 {}: {}", recipient, e),
        }
    }

    /// 向快照中的每个成员投递
    async fn fan_out(&self, recipients: &[SessionId], message: &SignalingMessage) {
        for recipient in recipients {
            self.deliver(recipient, message).await;
        }
    }

    /// 请求 Supervisor 异步回收会话
    pub fn request_eviction(&self, session_id: SessionId, reason: EvictionReason) {
        if self
            .evictions
            .send(Eviction { session_id, reason })
            .is_err()
        {
            debug!("Supervisor 已停止，忽略回收请求");
        }
    }
}

/// 房间 ID 非空、不超过 128 个字符、不含控制字符
pub fn validate_room_id(room_id: &str) -> Result<(), SignalingError> {
    if room_id.is_empty() {
        return Err(SignalingError::validation("roomId must not be empty"));
    }
    if room_id.chars().count() > MAX_ROOM_ID_LEN {
        return Err(SignalingError::validation(format!(
            "roomId must be at most {MAX_ROOM_ID_LEN} characters"
        )));
    }
    if room_id.chars().any(char::is_control) {
        return Err(SignalingError::validation(
            "roomId must not contain control characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sink::ChannelSink;
    use bytes::Bytes;
    use serde_json::{Value, json};

    struct Fixture {
        registry: Arc<RoomRegistry>,
        sessions: Arc<SessionManager>,
        router: SignalingRouter,
        evictions: mpsc::UnboundedReceiver<Eviction>,
    }

    fn fixture(max_members: Option<usize>) -> Fixture {
        let registry = Arc::new(RoomRegistry::new(max_members));
        let sessions = Arc::new(SessionManager::new(registry.clone()));
        let (tx, evictions) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(sessions.clone(), registry.clone(), tx);
        Fixture {
            registry,
            sessions,
            router,
            evictions,
        }
    }

    async fn connect(f: &Fixture) -> (SessionId, mpsc::UnboundedReceiver<Bytes>) {
        let (sink, rx) = ChannelSink::new();
        (f.sessions.register(Arc::new(sink)).await, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_slice(&frame).unwrap());
        }
        frames
    }

    fn join(room: &str) -> SignalingMessage {
        SignalingMessage::Join {
            room_id: room.to_string(),
            display_name: None,
        }
    }

    fn offer(target: &SessionId) -> SignalingMessage {
        SignalingMessage::Offer(Relayed {
            target: target.clone(),
            payload: json!("v=0..."),
        })
    }

    #[tokio::test]
    async fn test_second_joiner_notifies_first_only() {
        let f = fixture(None);
        let (a, mut rx_a) = connect(&f).await;
        let (b, mut rx_b) = connect(&f).await;

        f.router.route(&a, join("r1")).await.unwrap();
        f.router.route(&b, join("r1")).await.unwrap();

        let frames_a = drain(&mut rx_a);
        assert_eq!(frames_a.len(), 2);
        assert_eq!(frames_a[0]["type"], "joined");
        assert_eq!(frames_a[0]["members"], json!([]));
        assert_eq!(frames_a[1]["type"], "room-event");
        assert_eq!(frames_a[1]["kind"], "peer-joined");
        assert_eq!(frames_a[1]["sessionId"], b.as_str());

        let frames_b = drain(&mut rx_b);
        assert_eq!(frames_b.len(), 1);
        assert_eq!(frames_b[0]["type"], "joined");
        assert_eq!(frames_b[0]["members"], json!([a.as_str()]));
    }

    #[tokio::test]
    async fn test_offer_forwarded_with_sender() {
        let f = fixture(None);
        let (a, mut rx_a) = connect(&f).await;
        let (b, mut rx_b) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();
        f.router.route(&b, join("r1")).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.router.route(&a, offer(&b)).await.unwrap();

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "offer");
        assert_eq!(frames[0]["from"], a.as_str());
        assert_eq!(frames[0]["payload"], "v=0...");
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_offer_outside_room_is_unknown_target() {
        let f = fixture(None);
        let (a, _rx_a) = connect(&f).await;
        let (c, mut rx_c) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();
        f.router.route(&c, join("r2")).await.unwrap();
        drain(&mut rx_c);

        let err = f.router.route(&a, offer(&c)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTarget);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_unjoined_offer_is_not_in_room() {
        let f = fixture(None);
        let (a, _rx_a) = connect(&f).await;
        let (b, _rx_b) = connect(&f).await;

        let err = f.router.route(&a, offer(&b)).await.unwrap_err();
        assert_eq!(err, SignalingError::NotInRoom);
    }

    #[tokio::test]
    async fn test_join_while_in_room() {
        let f = fixture(None);
        let (a, _rx_a) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();

        let err = f.router.route(&a, join("r2")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyInRoom);
        assert!(!f.registry.contains_room("r2").await);
        assert_eq!(f.sessions.room_of(&a).await.unwrap().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_double_leave_broadcasts_once() {
        let f = fixture(None);
        let (a, _rx_a) = connect(&f).await;
        let (b, mut rx_b) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();
        f.router.route(&b, join("r1")).await.unwrap();
        drain(&mut rx_b);

        f.router.route(&a, SignalingMessage::Leave).await.unwrap();
        f.router.route(&a, SignalingMessage::Leave).await.unwrap();

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["kind"], "peer-left");
        assert_eq!(frames[0]["sessionId"], a.as_str());
        assert_eq!(f.sessions.room_of(&a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_leave_destroys_room() {
        let f = fixture(None);
        let (a, _rx_a) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();
        assert!(f.registry.contains_room("r1").await);

        f.router.route(&a, SignalingMessage::Leave).await.unwrap();
        assert!(!f.registry.contains_room("r1").await);
    }

    #[tokio::test]
    async fn test_room_full_leaves_state_untouched() {
        let f = fixture(Some(2));
        let (a, _rx_a) = connect(&f).await;
        let (b, _rx_b) = connect(&f).await;
        let (c, _rx_c) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();
        f.router.route(&b, join("r1")).await.unwrap();

        let err = f.router.route(&c, join("r1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoomFull);
        assert_eq!(f.sessions.room_of(&c).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_room_id_validation() {
        let f = fixture(None);
        let (a, _rx_a) = connect(&f).await;

        let too_long = "x".repeat(MAX_ROOM_ID_LEN + 1);
        for room in ["", "bad\nroom", too_long.as_str()] {
            let err = f.router.route(&a, join(room)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError);
        }
        assert!(validate_room_id(&"x".repeat(MAX_ROOM_ID_LEN)).is_ok());
        assert_eq!(f.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_ping_replies_pong() {
        let f = fixture(None);
        let (a, mut rx_a) = connect(&f).await;

        f.router.route(&a, SignalingMessage::Ping).await.unwrap();
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "pong");
    }

    #[tokio::test]
    async fn test_closed_target_requests_eviction() {
        let mut f = fixture(None);
        let (a, _rx_a) = connect(&f).await;
        let (b, rx_b) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();
        f.router.route(&b, join("r1")).await.unwrap();
        drop(rx_b);

        let err = f.router.route(&a, offer(&b)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);

        let eviction = f.evictions.recv().await.unwrap();
        assert_eq!(
            eviction,
            Eviction {
                session_id: b,
                reason: EvictionReason::ChannelClosed,
            }
        );
    }

    #[tokio::test]
    async fn test_reject_reaches_sender_only() {
        let f = fixture(None);
        let (a, mut rx_a) = connect(&f).await;
        let (b, mut rx_b) = connect(&f).await;
        f.router.route(&a, join("r1")).await.unwrap();
        f.router.route(&b, join("r1")).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.router
            .reject(&a, &SignalingError::validation("bad frame"))
            .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["kind"], "ValidationError");
        assert!(drain(&mut rx_b).is_empty());
    }
}
