//! 统一配置管理系统
//!
//! 本模块是 roomrelay 配置的"单一真理之源"。
//! 所有配置项的定义、文档、默认值都在这里统一管理。

pub mod bind;
pub mod signaling;

pub use crate::config::bind::{BindConfig, HttpBindConfig};
pub use crate::config::signaling::{
    ConnectionRateLimit, MessageRateLimit, RateLimitConfig, SignalingConfig,
};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// roomrelay 的主配置结构体
///
/// 配置文件使用 TOML 格式，支持完整的类型安全加载。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RelayConfig {
    /// 服务器实例名称
    ///
    /// 用于在日志和 `/rooms` 统计接口中标识实例，
    /// 建议使用有意义的命名规则，如：relay-01, relay-prod-east-1 等。
    pub name: String,

    /// 运行环境标识
    ///
    /// - "dev": 开发环境
    /// - "prod": 生产环境，额外检查日志配置
    /// - "test": 测试环境，用于自动化测试
    pub env: String,

    /// 位置标签
    ///
    /// 用于标识服务器的地理位置或逻辑分组，例如：us-west-1, edge-node-01
    #[serde(default = "default_location_tag")]
    pub location_tag: String,

    /// 网络绑定配置
    #[serde(default)]
    pub bind: BindConfig,

    /// 信令中继配置
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// 可观测性配置（日志）
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// 可观测性配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObservabilityConfig {
    /// 过滤级别
    ///
    /// 支持 EnvFilter 语法（如 "info,hyper=warn"）。默认值 "info"。
    #[serde(default = "default_filter_level")]
    pub filter_level: String,

    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    /// 日志输出目标
    ///
    /// - "console": 仅输出到控制台（默认）
    /// - "file": 输出到文件
    #[serde(default = "default_log_output")]
    pub output: String,

    /// 日志轮转开关
    ///
    /// 当 output = "file" 时有效：true 按天轮转，false 追加到单个文件
    #[serde(default)]
    pub rotate: bool,

    /// 日志文件目录，当 output = "file" 时有效
    #[serde(default = "default_log_path")]
    pub path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            rotate: false,
            path: default_log_path(),
        }
    }
}

fn default_location_tag() -> String {
    "default-location".to_string()
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_path() -> String {
    "logs/".to_string()
}

fn default_filter_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "roomrelay-default".to_string(),
            env: "dev".to_string(),
            location_tag: default_location_tag(),
            bind: BindConfig::default(),
            signaling: SignalingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl RelayConfig {
    /// 返回日志配置引用
    pub fn log_config(&self) -> &LogConfig {
        &self.observability.log
    }

    /// 检查是否使用控制台日志输出
    pub fn is_console_logging(&self) -> bool {
        self.observability.log.output == "console"
    }

    /// 获取日志过滤级别，优先使用 RUST_LOG
    pub fn get_filter_level(&self) -> String {
        std::env::var("RUST_LOG")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.observability.filter_level.clone())
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::FileNotFound {
                path: path_ref.display().to_string(),
            });
        }

        if !path_ref.is_file() {
            return Err(ConfigError::InvalidFormat {
                message: format!("Path is not a valid file: {}", path_ref.display()),
            });
        }

        let content = std::fs::read_to_string(path_ref)?;
        Self::from_toml(&content).map_err(|e| ConfigError::ParseError {
            source: Box::new(e),
        })
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// 将配置序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// 验证配置有效性
    ///
    /// 返回所有发现的问题。以 "Warning:" 开头的条目不阻止启动。
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Instance name cannot be empty".to_string());
        }

        if !["dev", "prod", "test"].contains(&self.env.as_str()) {
            errors.push(format!(
                "Invalid environment '{}', must be one of: dev, prod, test",
                self.env
            ));
        }

        // 过滤级别（EnvFilter 语法）只检查第一段
        {
            let main_level = self
                .observability
                .filter_level
                .split(',')
                .next()
                .unwrap_or("")
                .trim();
            if !["trace", "debug", "info", "warn", "error"].contains(&main_level) {
                errors.push(format!(
                    "Invalid filter level '{}', must start with one of: trace, debug, info, warn, error",
                    self.observability.filter_level
                ));
            }
        }

        if !["console", "file"].contains(&self.observability.log.output.as_str()) {
            errors.push(format!(
                "Invalid log output '{}' (observability.log.output), must be 'console' or 'file'",
                self.observability.log.output
            ));
        }

        if let Some(ref http) = self.bind.http
            && http.ip.parse::<std::net::IpAddr>().is_err()
        {
            errors.push(format!(
                "Invalid bind.http.ip '{}', must be a valid IP address",
                http.ip
            ));
        }

        if self.bind.http.is_none() {
            errors.push("bind.http is required to expose the relay".to_string());
        }

        errors.extend(self.signaling.validate());

        if self.env == "prod" {
            if self.observability.log.output == "console" {
                errors.push("Warning: Production environment should use file logging (observability.log.output = \"file\")".to_string());
            }

            if self.observability.log.output == "file" && !self.observability.log.rotate {
                errors.push("Warning: Production environment should enable log rotation (observability.log.rotate = true)".to_string());
            }

            if !self.signaling.rate_limit.connection.enabled
                || !self.signaling.rate_limit.message.enabled
            {
                errors.push(
                    "Warning: Production environment should keep rate limiting enabled".to_string(),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.name, "roomrelay-default");
        assert_eq!(config.env, "dev");
        assert_eq!(config.signaling.ws_path, "/ws");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_serialization() {
        let config = RelayConfig::default();
        let toml_str = config.to_toml().unwrap();
        assert!(toml_str.contains("name = \"roomrelay-default\""));

        let parsed_config = RelayConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed_config.name, config.name);
        assert_eq!(
            parsed_config.signaling.idle_timeout_secs,
            config.signaling.idle_timeout_secs
        );
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            name = "relay-min"
            env = "test"
        "#,
        )
        .unwrap();

        assert_eq!(config.location_tag, "default-location");
        assert_eq!(config.signaling.max_members_per_room, None);
        assert!(config.signaling.rate_limit.message.enabled);
        assert_eq!(config.observability.log.output, "console");
    }

    #[test]
    fn test_signaling_section_parsed() {
        let config = RelayConfig::from_toml(
            r#"
            name = "relay-a"
            env = "dev"

            [signaling]
            ws_path = "/signal"
            idle_timeout_secs = 30
            sweep_interval_secs = 5
            max_members_per_room = 2

            [signaling.rate_limit.message]
            enabled = false
        "#,
        )
        .unwrap();

        assert_eq!(config.signaling.ws_path, "/signal");
        assert_eq!(config.signaling.idle_timeout_secs, 30);
        assert_eq!(config.signaling.max_members_per_room, Some(2));
        assert!(!config.signaling.rate_limit.message.enabled);
        assert_eq!(config.signaling.rate_limit.message.per_second, 20);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = RelayConfig::default();
        config.name = "  ".to_string();
        config.env = "staging".to_string();
        config.observability.filter_level = "loud".to_string();
        config.signaling.idle_timeout_secs = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("Instance name")));
        assert!(errors.iter().any(|e| e.contains("Invalid environment")));
        assert!(errors.iter().any(|e| e.contains("Invalid filter level")));
        assert!(errors.iter().any(|e| e.contains("idle_timeout_secs")));
    }

    #[test]
    fn test_prod_console_logging_is_only_a_warning() {
        let mut config = RelayConfig::default();
        config.env = "prod".to_string();

        let errors = config.validate().unwrap_err();
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.starts_with("Warning:")));
    }

    #[test]
    fn test_from_file_missing() {
        let err = RelayConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
