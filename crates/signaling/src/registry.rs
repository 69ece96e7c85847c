//! 房间注册表
//!
//! 外层 map 只在查找、插入、删除房间条目时加锁；成员变更在每个房间自己的
//! 异步互斥锁内完成，所以不同房间之间互不阻塞。被删除的房间会打上墓碑标记，
//! 与删除竞争的加入者会看到标记并在新房间上重试。

use crate::error::SignalingError;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use relay_common::metrics::ACTIVE_ROOMS;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// 房间
#[derive(Debug)]
pub struct Room {
    id: String,
    members: HashSet<SessionId>,
    created_at: DateTime<Utc>,
    max_members: Option<usize>,
    /// 已从注册表移除
    closed: bool,
}

impl Room {
    fn new(id: &str, max_members: Option<usize>) -> Self {
        Self {
            id: id.to_string(),
            members: HashSet::new(),
            created_at: Utc::now(),
            max_members,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn max_members(&self) -> Option<usize> {
        self.max_members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.contains(session_id)
    }

    /// 成员快照，按 ID 排序以便日志和测试稳定
    pub fn snapshot(&self) -> Vec<SessionId> {
        let mut members: Vec<SessionId> = self.members.iter().cloned().collect();
        members.sort();
        members
    }
}

pub type RoomHandle = Arc<Mutex<Room>>;

/// 房间摘要（用于 `/rooms` 统计接口）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub members: usize,
    pub max_members: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.id().to_string(),
            members: room.len(),
            max_members: room.max_members(),
            created_at: room.created_at(),
        }
    }
}

/// 房间注册表
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    max_members: Option<usize>,
}

impl RoomRegistry {
    pub fn new(max_members: Option<usize>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_members,
        }
    }

    /// 获取房间，不存在则创建（幂等）
    pub async fn create_or_get_room(&self, room_id: &str) -> RoomHandle {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!("🏠 创建房间: {}", room_id);
                Arc::new(Mutex::new(Room::new(room_id, self.max_members)))
            })
            .clone()
    }

    /// 把会话加入房间，返回加入后的成员快照
    ///
    /// 房间按需创建，因此不会返回 `NotFound`；超过容量返回 `RoomFull`。
    /// 已经是成员时不做修改，直接返回当前快照。
    pub async fn add_member(
        &self,
        room_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<SessionId>, SignalingError> {
        loop {
            let handle = self.create_or_get_room(room_id).await;
            let mut room = handle.lock().await;

            if room.closed {
                drop(room);
                self.forget(room_id, &handle).await;
                continue;
            }

            if room.contains(session_id) {
                return Ok(room.snapshot());
            }

            if let Some(capacity) = room.max_members
                && room.len() >= capacity
            {
                return Err(SignalingError::RoomFull {
                    room_id: room_id.to_string(),
                    capacity,
                });
            }

            if room.is_empty() {
                ACTIVE_ROOMS.inc();
            }
            room.members.insert(session_id.clone());
            debug!(
                "➕ 会话 {} 加入房间 {} (成员数: {})",
                session_id,
                room_id,
                room.len()
            );
            return Ok(room.snapshot());
        }
    }

    /// 把会话移出房间，返回剩余成员快照
    ///
    /// 房间变空时删除并记录 `RoomEmptied` 事件。
    pub async fn remove_member(
        &self,
        room_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<SessionId>, SignalingError> {
        let handle = self
            .rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| SignalingError::room_not_found(room_id))?;

        let mut room = handle.lock().await;
        if room.closed {
            return Err(SignalingError::room_not_found(room_id));
        }
        if !room.members.remove(session_id) {
            return Err(SignalingError::session_not_found(session_id));
        }

        let remaining = room.snapshot();
        if room.is_empty() {
            room.closed = true;
            drop(room);
            self.forget(room_id, &handle).await;
            ACTIVE_ROOMS.dec();
            info!(room_id = %room_id, event = "RoomEmptied", "🏚️ 房间已清空并删除: {}", room_id);
        } else {
            debug!(
                "➖ 会话 {} 离开房间 {} (剩余: {})",
                session_id,
                room_id,
                remaining.len()
            );
        }

        Ok(remaining)
    }

    /// 成员快照，房间不存在时为空
    pub async fn list_members(&self, room_id: &str) -> Vec<SessionId> {
        let Some(handle) = self.rooms.read().await.get(room_id).cloned() else {
            return Vec::new();
        };
        let room = handle.lock().await;
        if room.closed {
            Vec::new()
        } else {
            room.snapshot()
        }
    }

    pub async fn is_member(&self, room_id: &str, session_id: &SessionId) -> bool {
        let Some(handle) = self.rooms.read().await.get(room_id).cloned() else {
            return false;
        };
        let room = handle.lock().await;
        !room.closed && room.contains(session_id)
    }

    /// 至少有一个成员的房间是否存在
    pub async fn contains_room(&self, room_id: &str) -> bool {
        !self.list_members(room_id).await.is_empty()
    }

    /// 当前有成员的房间数
    pub async fn room_count(&self) -> usize {
        self.rooms().await.len()
    }

    /// 所有非空房间的摘要
    pub async fn rooms(&self) -> Vec<RoomSummary> {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let room = handle.lock().await;
            if room.closed || room.is_empty() {
                continue;
            }
            summaries.push(RoomSummary::from(&*room));
        }
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    /// 删除从未有人加入的空房间，返回删除数量
    pub async fn prune_empty(&self) -> usize {
        let handles: Vec<(String, RoomHandle)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut pruned = 0;
        for (room_id, handle) in handles {
            let mut room = handle.lock().await;
            if room.closed || !room.is_empty() {
                continue;
            }
            room.closed = true;
            drop(room);
            self.forget(&room_id, &handle).await;
            pruned += 1;
        }

        if pruned > 0 {
            debug!("🧹 清理了 {} 个空房间", pruned);
        }
        pruned
    }

    /// 删除所有房间（关闭时使用）
    pub async fn clear(&self) {
        let drained: Vec<RoomHandle> = self.rooms.write().await.drain().map(|(_, h)| h).collect();
        for handle in drained {
            let mut room = handle.lock().await;
            if !room.closed && !room.is_empty() {
                ACTIVE_ROOMS.dec();
            }
            room.closed = true;
            room.members.clear();
        }
    }

    /// 移除墓碑条目；若 map 中已是新房间则保留
    async fn forget(&self, room_id: &str, handle: &RoomHandle) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            rooms.remove(room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sid(id: &str) -> SessionId {
        SessionId::from(id)
    }

    #[tokio::test]
    async fn test_first_join_creates_room_and_last_leave_destroys_it() {
        let registry = RoomRegistry::new(None);

        let members = registry.add_member("r1", &sid("A")).await.unwrap();
        assert_eq!(members, vec![sid("A")]);
        assert_eq!(registry.room_count().await, 1);

        let remaining = registry.remove_member("r1", &sid("A")).await.unwrap();
        assert!(remaining.is_empty());
        assert_eq!(registry.room_count().await, 0);
        assert!(!registry.contains_room("r1").await);
    }

    #[tokio::test]
    async fn test_add_member_returns_snapshot_with_joiner() {
        let registry = RoomRegistry::new(None);
        registry.add_member("r1", &sid("A")).await.unwrap();

        let members = registry.add_member("r1", &sid("B")).await.unwrap();
        assert_eq!(members, vec![sid("A"), sid("B")]);

        // 重复加入不改变成员
        let members = registry.add_member("r1", &sid("B")).await.unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let registry = RoomRegistry::new(Some(2));
        registry.add_member("r1", &sid("A")).await.unwrap();
        registry.add_member("r1", &sid("B")).await.unwrap();

        let err = registry.add_member("r1", &sid("C")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RoomFull);
        assert_eq!(registry.list_members("r1").await, vec![sid("A"), sid("B")]);
    }

    #[tokio::test]
    async fn test_room_summary_reports_capacity_and_creation_time() {
        let before = Utc::now();
        let registry = RoomRegistry::new(Some(4));
        registry.add_member("r1", &sid("A")).await.unwrap();

        let summaries = registry.rooms().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].members, 1);
        assert_eq!(summaries[0].max_members, Some(4));
        assert!(summaries[0].created_at >= before);
    }

    #[tokio::test]
    async fn test_remove_unknown_member_or_room() {
        let registry = RoomRegistry::new(None);
        let err = registry.remove_member("nope", &sid("A")).await.unwrap_err();
        assert_eq!(err, SignalingError::room_not_found("nope"));

        registry.add_member("r1", &sid("A")).await.unwrap();
        let err = registry.remove_member("r1", &sid("B")).await.unwrap_err();
        assert_eq!(err, SignalingError::session_not_found(&sid("B")));
    }

    #[tokio::test]
    async fn test_rejoin_after_room_destroyed_gets_fresh_room() {
        let registry = RoomRegistry::new(None);
        registry.add_member("r1", &sid("A")).await.unwrap();
        let first = registry.create_or_get_room("r1").await;
        registry.remove_member("r1", &sid("A")).await.unwrap();

        registry.add_member("r1", &sid("B")).await.unwrap();
        let second = registry.create_or_get_room("r1").await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.list_members("r1").await, vec![sid("B")]);
    }

    #[tokio::test]
    async fn test_prune_empty_rooms() {
        let registry = RoomRegistry::new(None);
        registry.create_or_get_room("ghost").await;
        registry.add_member("r1", &sid("A")).await.unwrap();

        assert_eq!(registry.prune_empty().await, 1);
        assert_eq!(registry.rooms().await.len(), 1);
        assert_eq!(registry.rooms().await[0].room_id, "r1");
    }

    #[tokio::test]
    async fn test_concurrent_joins_and_leaves_keep_membership_consistent() {
        let registry = Arc::new(RoomRegistry::new(None));

        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = sid(&format!("s{i}"));
                registry.add_member("busy", &id).await.unwrap();
                if i % 2 == 0 {
                    registry.remove_member("busy", &id).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.list_members("busy").await.len(), 16);
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let registry = RoomRegistry::new(None);
        registry.add_member("r1", &sid("A")).await.unwrap();
        registry.add_member("r2", &sid("B")).await.unwrap();

        registry.clear().await;
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.list_members("r1").await.is_empty());
    }
}
