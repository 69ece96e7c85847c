//! 中继入口
//!
//! [`Relay`] 持有注册表、会话管理器、路由器和 Supervisor，对传输层只暴露
//! `connect` / `on_message` / `on_close` / `shutdown` 四个入口。

use crate::error::SignalingError;
use crate::message::SignalingMessage;
use crate::ratelimit::ConnectionRateLimiter;
use crate::registry::{RoomRegistry, RoomSummary};
use crate::router::{EvictionReason, SignalingRouter};
use crate::session::{SessionId, SessionManager};
use crate::sink::MessageSink;
use crate::supervisor::Supervisor;
use relay_common::config::signaling::SignalingConfig;
use relay_common::metrics::ERRORS_TOTAL;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 中继统计（`/rooms` 接口）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub sessions: usize,
    pub room_count: usize,
    pub rooms: Vec<RoomSummary>,
}

#[derive(Debug)]
pub struct Relay {
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionManager>,
    router: Arc<SignalingRouter>,
    supervisor: Arc<Supervisor>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// 创建中继并启动 Supervisor 后台任务
    ///
    /// 必须在 tokio 运行时内调用。
    ///
    /// `connection_limiter` 中空闲的 IP 记录随 Supervisor 巡检一并清理。
    pub fn start(
        config: &SignalingConfig,
        connection_limiter: Option<Arc<ConnectionRateLimiter>>,
    ) -> Arc<Self> {
        Self::build(
            config.max_members_per_room,
            config.idle_timeout(),
            config.sweep_interval(),
            connection_limiter,
        )
    }

    pub fn with_timing(
        max_members: Option<usize>,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Self::build(max_members, idle_timeout, sweep_interval, None)
    }

    fn build(
        max_members: Option<usize>,
        idle_timeout: Duration,
        sweep_interval: Duration,
        connection_limiter: Option<Arc<ConnectionRateLimiter>>,
    ) -> Arc<Self> {
        let registry = Arc::new(RoomRegistry::new(max_members));
        let sessions = Arc::new(SessionManager::new(registry.clone()));
        let (eviction_tx, eviction_rx) = mpsc::unbounded_channel();
        let router = Arc::new(SignalingRouter::new(
            sessions.clone(),
            registry.clone(),
            eviction_tx,
        ));
        let supervisor = Arc::new(Supervisor::new(
            router.clone(),
            sessions.clone(),
            registry.clone(),
            idle_timeout,
            sweep_interval,
        )
        .with_connection_limiter(connection_limiter));
        let task = supervisor.clone().spawn(eviction_rx);

        info!(
            "✅ 信令中继已初始化 (房间容量: {})",
            max_members.map_or_else(|| "unlimited".to_string(), |m| m.to_string())
        );

        Arc::new(Self {
            registry,
            sessions,
            router,
            supervisor,
            supervisor_task: Mutex::new(Some(task)),
        })
    }

    /// 注册新连接并发送 welcome
    pub async fn connect(&self, sink: Arc<dyn MessageSink>) -> Result<SessionId, SignalingError> {
        let session_id = self.sessions.register(sink).await;
        let welcome = SignalingMessage::Welcome {
            session_id: session_id.clone(),
        };
        if let Err(e) = self.sessions.send(&session_id, &welcome, None).await {
            self.sessions.unregister(&session_id).await;
            return Err(e);
        }
        Ok(session_id)
    }

    /// 处理传输层收到的一帧
    ///
    /// 错误已经以 error 帧回送给发送方，返回值只用于日志。
    pub async fn on_message(
        &self,
        session_id: &SessionId,
        frame: &[u8],
    ) -> Result<(), SignalingError> {
        let result = match SignalingMessage::decode_client(frame) {
            Ok(message) => self.router.route(session_id, message).await,
            Err(e) => {
                // 非法帧也算活动
                if let Err(touch_err) = self.sessions.touch(session_id).await {
                    warn!("无法刷新会话 {} 的活跃时间: {}", session_id, touch_err);
                }
                Err(e)
            }
        };

        if let Err(e) = &result {
            self.router.reject(session_id, e).await;
        }
        result
    }

    /// 路由一条已解码的消息，不回送 error 帧（HTTP 接口用响应体报告错误）
    pub async fn dispatch(
        &self,
        session_id: &SessionId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        let result = self.router.route(session_id, message).await;
        if let Err(e) = &result {
            ERRORS_TOTAL
                .with_label_values(&[e.kind().as_ref()])
                .inc();
        }
        result
    }

    /// 传输层关闭
    pub async fn on_close(&self, session_id: &SessionId) {
        if self
            .supervisor
            .cleanup(session_id, EvictionReason::Disconnected)
            .await
        {
            debug!("会话 {} 断开后已清理", session_id);
        }
    }

    /// 停止 Supervisor 并移除所有会话
    pub async fn shutdown(&self) {
        self.supervisor.stop();
        if let Some(task) = self.supervisor_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!("Supervisor 任务异常退出: {}", e);
        }

        let session_ids = self.sessions.session_ids().await;
        let count = session_ids.len();
        for session_id in session_ids {
            self.supervisor
                .cleanup(&session_id, EvictionReason::Shutdown)
                .await;
        }
        self.registry.clear().await;

        info!("🛑 信令中继已关闭 (清理会话: {})", count);
    }

    pub async fn stats(&self) -> RelayStats {
        let rooms = self.registry.rooms().await;
        RelayStats {
            sessions: self.sessions.session_count().await,
            room_count: rooms.len(),
            rooms,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<SignalingRouter> {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }
}
