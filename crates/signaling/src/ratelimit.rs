//! 信令中继速率限制
//!
//! 实现双重速率限制：
//! 1. **连接速率限制**：限制每个 IP 建立新连接（WebSocket 或 SSE）的速率和并发数，
//!    空闲 IP 的限制器随 Supervisor 巡检清理
//! 2. **消息速率限制**：限制每个会话发送信令消息的速率
//!
//! 使用 governor crate 实现，配置来自 `[signaling.rate_limit]`

use crate::error::SignalingError;
use crate::session::SessionId;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use relay_common::config::signaling::{ConnectionRateLimit, MessageRateLimit};
use relay_common::metrics::RATE_LIMIT_EXCEEDED;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 配置值为 0 时退化为 1，避免构造非法 quota
fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// 单个 IP 的连接速率限制器
#[derive(Debug)]
struct IpLimiter {
    limiter: DefaultDirectRateLimiter,
    last_seen: Instant,
}

/// 连接速率限制器（基于 IP）
#[derive(Debug)]
pub struct ConnectionRateLimiter {
    config: ConnectionRateLimit,
    /// 每个 IP 的速率限制器
    limiters: RwLock<HashMap<IpAddr, IpLimiter>>,
    /// 每个 IP 的当前连接数，由 [`ConnectionPermit`] 在 drop 时同步释放
    connections: Mutex<HashMap<IpAddr, u32>>,
}

/// 一个已计入并发数的连接，drop 时释放
#[derive(Debug)]
pub struct ConnectionPermit {
    limiter: Option<Arc<ConnectionRateLimiter>>,
    ip: IpAddr,
}

impl ConnectionPermit {
    /// 不受限制的连接（速率限制关闭时使用）
    pub fn unlimited(ip: IpAddr) -> Self {
        Self { limiter: None, ip }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        if let Some(limiter) = &self.limiter {
            limiter.release(self.ip);
        }
    }
}

impl ConnectionRateLimiter {
    pub fn new(config: ConnectionRateLimit) -> Self {
        Self {
            config,
            limiters: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn per_second(&self) -> u32 {
        // 每分钟 per_minute 个连接，转换为每秒
        (self.config.per_minute as f64 / 60.0).ceil().max(1.0) as u32
    }

    /// 令牌桶从空到满所需时间，超过这段时间未活动的限制器与新建的等价
    fn replenish_period(&self) -> Duration {
        Duration::from_secs_f64(
            non_zero(self.config.burst_size).get() as f64 / self.per_second() as f64,
        )
    }

    /// 检查并占用一个连接名额
    ///
    /// 速率检查通过后，并发数的检查与计数在同一次加锁内完成。
    pub async fn acquire(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionPermit, SignalingError> {
        if !self.config.enabled {
            return Ok(ConnectionPermit::unlimited(ip));
        }

        self.check_rate(ip).await?;

        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let count = connections.entry(ip).or_insert(0);
        if *count >= self.config.max_concurrent_per_ip {
            warn!(
                "IP {} exceeded max concurrent connections: {}/{}",
                ip, count, self.config.max_concurrent_per_ip
            );
            RATE_LIMIT_EXCEEDED
                .with_label_values(&["concurrent_connections"])
                .inc();
            let err = SignalingError::RateLimited(format!(
                "too many concurrent connections from your IP: {}/{}",
                count, self.config.max_concurrent_per_ip
            ));
            if *count == 0 {
                connections.remove(&ip);
            }
            return Err(err);
        }
        *count += 1;
        debug!("IP {} connection count: {}", ip, count);

        Ok(ConnectionPermit {
            limiter: Some(self.clone()),
            ip,
        })
    }

    async fn check_rate(&self, ip: IpAddr) -> Result<(), SignalingError> {
        let mut limiters = self.limiters.write().await;
        let entry = limiters.entry(ip).or_insert_with(|| {
            let quota = Quota::per_second(non_zero(self.per_second()))
                .allow_burst(non_zero(self.config.burst_size));
            IpLimiter {
                limiter: RateLimiter::direct(quota),
                last_seen: Instant::now(),
            }
        });
        entry.last_seen = Instant::now();

        match entry.limiter.check() {
            Ok(_) => {
                debug!("IP {} passed connection rate limit check", ip);
                Ok(())
            }
            Err(_) => {
                warn!("IP {} exceeded connection rate limit", ip);
                RATE_LIMIT_EXCEEDED.with_label_values(&["connection"]).inc();
                Err(SignalingError::RateLimited(format!(
                    "too many connection attempts, limit: {} connections/minute",
                    self.config.per_minute
                )))
            }
        }
    }

    /// 释放连接名额
    fn release(&self, ip: IpAddr) {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            debug!("IP {} connection count decreased to: {}", ip, count);

            // 如果连接数为 0，移除记录以节省内存
            if *count == 0 {
                connections.remove(&ip);
            }
        }
    }

    /// 移除没有活动连接且令牌桶已经回满的 IP 限制器，返回移除数量
    pub async fn prune_idle(&self) -> usize {
        let period = self.replenish_period();
        let now = Instant::now();
        let active: Vec<IpAddr> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();

        let mut limiters = self.limiters.write().await;
        let before = limiters.len();
        limiters.retain(|ip, entry| {
            active.contains(ip) || now.duration_since(entry.last_seen) < period
        });
        let pruned = before - limiters.len();
        if pruned > 0 {
            info!("🧽 清理 {} 个空闲 IP 连接限制器", pruned);
        }
        pruned
    }

    /// (限制器数量, 有连接的 IP 数量)
    pub async fn stats(&self) -> (usize, usize) {
        let limiters = self.limiters.read().await.len();
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        (limiters, connections)
    }
}

/// 消息速率限制器（基于会话）
#[derive(Debug)]
pub struct MessageRateLimiter {
    config: MessageRateLimit,
    limiters: RwLock<HashMap<SessionId, DefaultDirectRateLimiter>>,
}

impl MessageRateLimiter {
    pub fn new(config: MessageRateLimit) -> Self {
        Self {
            config,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// 检查会话是否还能发送消息
    pub async fn check_message(&self, session_id: &SessionId) -> Result<(), SignalingError> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut limiters = self.limiters.write().await;
        let limiter = limiters.entry(session_id.clone()).or_insert_with(|| {
            let quota = Quota::per_second(non_zero(self.config.per_second))
                .allow_burst(non_zero(self.config.burst_size));
            RateLimiter::direct(quota)
        });

        match limiter.check() {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Session {} exceeded message rate limit", session_id);
                RATE_LIMIT_EXCEEDED.with_label_values(&["message"]).inc();
                Err(SignalingError::RateLimited(format!(
                    "too many messages, limit: {} messages/second",
                    self.config.per_second
                )))
            }
        }
    }

    /// 移除会话的速率限制器（连接关闭时调用）
    pub async fn remove_session(&self, session_id: &SessionId) {
        if !self.config.enabled {
            return;
        }

        self.limiters.write().await.remove(session_id);
        debug!("Removed rate limiter for session {}", session_id);
    }

    pub async fn stats(&self) -> usize {
        self.limiters.read().await.len()
    }
}
