//! 会话生命周期监管
//!
//! 后台任务定期回收空闲会话、清理空房间和空闲的 IP 限制器，并立即处理路由器和
//! 传输层发来的回收请求。回收 = 离开房间（广播 peer-left）+ 注销会话，
//! 对已移除的会话是空操作。

use crate::ratelimit::ConnectionRateLimiter;
use crate::registry::RoomRegistry;
use crate::router::{Eviction, EvictionReason, SignalingRouter};
use crate::session::{SessionId, SessionManager};
use relay_common::metrics::EVICTIONS_TOTAL;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Supervisor {
    router: Arc<SignalingRouter>,
    sessions: Arc<SessionManager>,
    registry: Arc<RoomRegistry>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    connection_limiter: Option<Arc<ConnectionRateLimiter>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        router: Arc<SignalingRouter>,
        sessions: Arc<SessionManager>,
        registry: Arc<RoomRegistry>,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            router,
            sessions,
            registry,
            idle_timeout,
            sweep_interval,
            connection_limiter: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 巡检时一并清理该限制器中空闲的 IP
    pub fn with_connection_limiter(mut self, limiter: Option<Arc<ConnectionRateLimiter>>) -> Self {
        self.connection_limiter = limiter;
        self
    }

    /// 回收一个会话，返回是否真的移除了会话
    pub async fn cleanup(&self, session_id: &SessionId, reason: EvictionReason) -> bool {
        if !self.router.evict(session_id).await {
            debug!("会话 {} 已被移除，跳过回收", session_id);
            return false;
        }

        EVICTIONS_TOTAL.with_label_values(&[reason.as_ref()]).inc();
        info!("🧹 回收会话 {} (原因: {})", session_id, reason.as_ref());
        true
    }

    /// 执行一轮巡检，返回回收的会话数
    pub async fn sweep(&self) -> usize {
        let mut evicted = 0;
        for session_id in self.sessions.idle_sessions(self.idle_timeout).await {
            if self.cleanup(&session_id, EvictionReason::IdleTimeout).await {
                evicted += 1;
            }
        }

        let pruned = self.registry.prune_empty().await;
        if let Some(limiter) = &self.connection_limiter {
            limiter.prune_idle().await;
        }
        if evicted > 0 || pruned > 0 {
            info!(
                "🔍 巡检完成: 回收 {} 个空闲会话, 清理 {} 个空房间",
                evicted, pruned
            );
        }
        evicted
    }

    /// 启动后台任务
    pub fn spawn(
        self: Arc<Self>,
        mut evictions: mpsc::UnboundedReceiver<Eviction>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval 的第一次 tick 立即完成
            ticker.tick().await;

            info!(
                "👀 Supervisor 已启动 (空闲超时: {:?}, 巡检间隔: {:?})",
                self.idle_timeout, self.sweep_interval
            );

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    request = evictions.recv() => match request {
                        Some(Eviction { session_id, reason }) => {
                            self.cleanup(&session_id, reason).await;
                        }
                        None => break,
                    },
                }
            }

            info!("Supervisor 已停止");
        })
    }

    /// 停止后台任务
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
