//! 会话管理
//!
//! 会话由 [`SessionManager`] 独占持有，房间和路由器只通过 [`SessionId`] 引用它。
//! 同一会话的状态迁移（加入、离开、注销）在会话自己的迁移锁内串行执行。

use crate::error::SignalingError;
use crate::message::SignalingMessage;
use crate::registry::RoomRegistry;
use crate::sink::MessageSink;
use chrono::{DateTime, Utc};
use relay_common::metrics::ACTIVE_SESSIONS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 不透明的会话 ID（UUIDv4）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug)]
struct SessionState {
    display_name: Option<String>,
    room_id: Option<String>,
    last_activity: Instant,
    closed: bool,
}

/// 单个客户端会话
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    sink: Arc<dyn MessageSink>,
    created_at: DateTime<Utc>,
    seq: AtomicU64,
    transition: Mutex<()>,
    state: RwLock<SessionState>,
}

impl Session {
    fn new(id: SessionId, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            id,
            sink,
            created_at: Utc::now(),
            seq: AtomicU64::new(0),
            transition: Mutex::new(()),
            state: RwLock::new(SessionState {
                display_name: None,
                room_id: None,
                last_activity: Instant::now(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn room_id(&self) -> Option<String> {
        self.state.read().await.room_id.clone()
    }

    pub async fn display_name(&self) -> Option<String> {
        self.state.read().await.display_name.clone()
    }

    pub async fn last_activity(&self) -> Instant {
        self.state.read().await.last_activity
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// 获取迁移锁，持有期间该会话的其他状态迁移会等待
    pub(crate) async fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().await
    }

    /// 分配序号、编码并投递
    pub fn deliver(
        &self,
        message: &SignalingMessage,
        from: Option<&SessionId>,
    ) -> Result<(), SignalingError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.sink
            .send(message.encode(from, Some(seq)))
            .map_err(|_| SignalingError::ChannelClosed(self.id.clone()))
    }
}

/// 注销时离开的房间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: String,
    /// 离开后房间内剩余的成员快照
    pub remaining: Vec<SessionId>,
}

/// [`SessionManager::unregister`] 的结果
#[derive(Debug)]
pub struct Unregistered {
    pub session: Arc<Session>,
    pub departed: Option<Departure>,
}

/// 会话管理器
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    registry: Arc<RoomRegistry>,
}

impl SessionManager {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// 注册新会话，返回新分配的 ID
    pub async fn register(&self, sink: Arc<dyn MessageSink>) -> SessionId {
        let mut sessions = self.sessions.write().await;
        let id = loop {
            let candidate = SessionId::generate();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
            warn!("会话 ID 冲突，重新生成: {}", candidate);
        };

        sessions.insert(id.clone(), Arc::new(Session::new(id.clone(), sink)));
        ACTIVE_SESSIONS.inc();
        info!("🆕 注册会话: {} (当前会话数: {})", id, sessions.len());
        id
    }

    pub async fn get(&self, id: &SessionId) -> Result<Arc<Session>, SignalingError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SignalingError::session_not_found(id))
    }

    /// 记录会话所在房间
    ///
    /// 调用方须先完成 `RoomRegistry::add_member`。
    pub async fn attach_room(&self, id: &SessionId, room_id: &str) -> Result<(), SignalingError> {
        let session = self.get(id).await?;
        let mut state = session.state.write().await;
        if state.closed {
            return Err(SignalingError::session_not_found(id));
        }
        if let Some(current) = &state.room_id {
            return Err(SignalingError::AlreadyInRoom {
                room_id: current.clone(),
            });
        }
        state.room_id = Some(room_id.to_string());
        Ok(())
    }

    /// 清除会话所在房间，返回之前的房间
    pub async fn detach_room(&self, id: &SessionId) -> Result<Option<String>, SignalingError> {
        let session = self.get(id).await?;
        let room_id = session.state.write().await.room_id.take();
        Ok(room_id)
    }

    pub async fn set_display_name(
        &self,
        id: &SessionId,
        display_name: Option<String>,
    ) -> Result<(), SignalingError> {
        let session = self.get(id).await?;
        session.state.write().await.display_name = display_name;
        Ok(())
    }

    /// 注销会话（幂等）
    ///
    /// 在会话的迁移锁内依次完成：标记关闭、从注册表移除成员、删除会话本身。
    /// 之后排队等待迁移锁的 join 会看到关闭标记而失败，不会重新加入房间。
    /// 会话不存在或已注销时返回 `None`。
    pub async fn unregister(&self, id: &SessionId) -> Option<Unregistered> {
        let session = self.sessions.read().await.get(id).cloned()?;
        let _transition = session.lock_transition().await;

        let room_id = {
            let mut state = session.state.write().await;
            if state.closed {
                return None;
            }
            state.closed = true;
            state.room_id.take()
        };

        let departed = match room_id {
            Some(room_id) => match self.registry.remove_member(&room_id, id).await {
                Ok(remaining) => Some(Departure { room_id, remaining }),
                Err(e) => {
                    error!(
                        "❗ 会话 {} 认为自己在房间 {} 中，但注册表不一致: {}",
                        id, room_id, e
                    );
                    None
                }
            },
            None => None,
        };

        if self.sessions.write().await.remove(id).is_some() {
            ACTIVE_SESSIONS.dec();
        }
        debug!(
            "🗑️ 注销会话: {} (存活 {}s)",
            id,
            (Utc::now() - session.created_at).num_seconds()
        );

        drop(_transition);
        Some(Unregistered { session, departed })
    }

    /// 向会话投递一条消息
    pub async fn send(
        &self,
        id: &SessionId,
        message: &SignalingMessage,
        from: Option<&SessionId>,
    ) -> Result<(), SignalingError> {
        self.get(id).await?.deliver(message, from)
    }

    /// 刷新最后活跃时间
    pub async fn touch(&self, id: &SessionId) -> Result<(), SignalingError> {
        let session = self.get(id).await?;
        session.state.write().await.last_activity = Instant::now();
        Ok(())
    }

    pub async fn room_of(&self, id: &SessionId) -> Result<Option<String>, SignalingError> {
        Ok(self.get(id).await?.room_id().await)
    }

    /// 超过 `timeout` 没有活动的会话
    pub async fn idle_sessions(&self, timeout: Duration) -> Vec<SessionId> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let now = Instant::now();

        let mut idle = Vec::new();
        for session in sessions {
            let state = session.state.read().await;
            if !state.closed && now.duration_since(state.last_activity) >= timeout {
                idle.push(session.id.clone());
            }
        }
        idle
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sink::ChannelSink;
    use bytes::Bytes;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn manager() -> (Arc<RoomRegistry>, SessionManager) {
        let registry = Arc::new(RoomRegistry::new(None));
        (registry.clone(), SessionManager::new(registry))
    }

    async fn register(manager: &SessionManager) -> (SessionId, mpsc::UnboundedReceiver<Bytes>) {
        let (sink, rx) = ChannelSink::new();
        (manager.register(Arc::new(sink)).await, rx)
    }

    #[tokio::test]
    async fn test_register_assigns_unique_ids() {
        let (_, manager) = manager();
        let (a, _rx_a) = register(&manager).await;
        let (b, _rx_b) = register(&manager).await;

        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
        assert_eq!(manager.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_send_stamps_increasing_seq() {
        let (_, manager) = manager();
        let (id, mut rx) = register(&manager).await;

        manager.send(&id, &SignalingMessage::Pong, None).await.unwrap();
        manager.send(&id, &SignalingMessage::Pong, None).await.unwrap();

        let first: Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["seq"], 1);
        assert_eq!(second["seq"], 2);
    }

    #[tokio::test]
    async fn test_send_to_closed_channel() {
        let (_, manager) = manager();
        let (id, rx) = register(&manager).await;
        drop(rx);

        let err = manager
            .send(&id, &SignalingMessage::Pong, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);

        let err = manager
            .send(&SessionId::from("missing"), &SignalingMessage::Pong, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_attach_twice_is_rejected() {
        let (_, manager) = manager();
        let (id, _rx) = register(&manager).await;

        manager.attach_room(&id, "r1").await.unwrap();
        let err = manager.attach_room(&id, "r2").await.unwrap_err();
        assert_eq!(
            err,
            SignalingError::AlreadyInRoom {
                room_id: "r1".to_string()
            }
        );
        assert_eq!(manager.room_of(&id).await.unwrap().as_deref(), Some("r1"));

        assert_eq!(manager.detach_room(&id).await.unwrap().as_deref(), Some("r1"));
        assert_eq!(manager.room_of(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unregister_removes_membership_and_is_idempotent() {
        let (registry, manager) = manager();
        let (id, _rx) = register(&manager).await;
        let (peer, _rx_peer) = register(&manager).await;
        registry.add_member("r1", &peer).await.unwrap();
        registry.add_member("r1", &id).await.unwrap();
        manager.attach_room(&peer, "r1").await.unwrap();
        manager.attach_room(&id, "r1").await.unwrap();

        let removed = manager.unregister(&id).await.unwrap();
        assert!(removed.session.is_closed().await);
        assert_eq!(
            removed.departed,
            Some(Departure {
                room_id: "r1".to_string(),
                remaining: vec![peer.clone()],
            })
        );
        assert_eq!(registry.list_members("r1").await, vec![peer.clone()]);

        // 最后一个成员离开后房间被删除
        let removed = manager.unregister(&peer).await.unwrap();
        assert_eq!(removed.departed.unwrap().remaining, Vec::<SessionId>::new());
        assert!(!registry.contains_room("r1").await);
        assert_eq!(manager.session_count().await, 0);

        assert!(manager.unregister(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_follow_last_activity() {
        let (_, manager) = manager();
        let (quiet, _rx_q) = register(&manager).await;
        let (chatty, _rx_c) = register(&manager).await;

        tokio::time::advance(Duration::from_secs(40)).await;
        manager.touch(&chatty).await.unwrap();
        tokio::time::advance(Duration::from_secs(25)).await;

        let idle = manager.idle_sessions(Duration::from_secs(60)).await;
        assert_eq!(idle, vec![quiet]);
    }
}
