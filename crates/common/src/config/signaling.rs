//! Signaling 中继配置

use serde::{Deserialize, Serialize};

/// 信令中继配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalingConfig {
    /// WebSocket 路径
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// 会话空闲超时（秒）
    ///
    /// 超过该时间没有任何入站消息的会话会被 Supervisor 回收，
    /// 这也是传输层断开信号丢失时清理延迟的上限。
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Supervisor 巡检间隔（秒）
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// 单个房间的最大成员数，未设置表示不限制
    #[serde(default)]
    pub max_members_per_room: Option<usize>,

    /// 速率限制配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// 速率限制配置
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RateLimitConfig {
    /// 连接速率限制配置
    #[serde(default)]
    pub connection: ConnectionRateLimit,

    /// 消息速率限制配置
    #[serde(default)]
    pub message: MessageRateLimit,
}

/// 连接速率限制配置（按客户端 IP）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionRateLimit {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 每分钟允许的新连接数
    #[serde(default = "default_connections_per_minute")]
    pub per_minute: u32,

    /// 突发允许的连接数
    #[serde(default = "default_connection_burst")]
    pub burst_size: u32,

    /// 每个 IP 的最大并发连接数
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_per_ip: u32,
}

/// 消息速率限制配置（按会话）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageRateLimit {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 每秒允许的消息数
    #[serde(default = "default_messages_per_second")]
    pub per_second: u32,

    /// 突发允许的消息数
    #[serde(default = "default_message_burst")]
    pub burst_size: u32,
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_connections_per_minute() -> u32 {
    60
}

fn default_connection_burst() -> u32 {
    20
}

fn default_max_concurrent_connections() -> u32 {
    100
}

fn default_messages_per_second() -> u32 {
    20
}

fn default_message_burst() -> u32 {
    50
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ws_path: default_ws_path(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_members_per_room: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for ConnectionRateLimit {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            per_minute: default_connections_per_minute(),
            burst_size: default_connection_burst(),
            max_concurrent_per_ip: default_max_concurrent_connections(),
        }
    }
}

impl Default for MessageRateLimit {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            per_second: default_messages_per_second(),
            burst_size: default_message_burst(),
        }
    }
}

impl SignalingConfig {
    /// 检查信令配置，返回发现的问题列表
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.ws_path.starts_with('/') {
            errors.push(format!(
                "signaling.ws_path '{}' must start with '/'",
                self.ws_path
            ));
        }

        if self.idle_timeout_secs == 0 {
            errors.push("signaling.idle_timeout_secs must be greater than 0".to_string());
        }

        if self.sweep_interval_secs == 0 {
            errors.push("signaling.sweep_interval_secs must be greater than 0".to_string());
        } else if self.idle_timeout_secs > 0 && self.sweep_interval_secs > self.idle_timeout_secs
        {
            errors.push(format!(
                "signaling.sweep_interval_secs ({}) must not exceed idle_timeout_secs ({})",
                self.sweep_interval_secs, self.idle_timeout_secs
            ));
        }

        if let Some(max) = self.max_members_per_room
            && max < 2
        {
            errors.push(format!(
                "signaling.max_members_per_room ({max}) must be at least 2 for peers to meet"
            ));
        }

        let connection = &self.rate_limit.connection;
        if connection.enabled
            && (connection.per_minute == 0
                || connection.burst_size == 0
                || connection.max_concurrent_per_ip == 0)
        {
            errors.push(
                "signaling.rate_limit.connection values must be greater than 0 when enabled"
                    .to_string(),
            );
        }

        let message = &self.rate_limit.message;
        if message.enabled && (message.per_second == 0 || message.burst_size == 0) {
            errors.push(
                "signaling.rate_limit.message values must be greater than 0 when enabled"
                    .to_string(),
            );
        }

        errors
    }

    /// 空闲超时
    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }

    /// 巡检间隔
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}
