//! 统一错误处理模型
//!
//! 提供主应用 roomrelay 的顶层错误类型，聚合所有子模块和依赖 crate 的错误

use thiserror::Error;

/// 主应用的统一错误枚举
#[derive(Debug, Error)]
pub enum Error {
    // ========== 配置相关错误 ==========
    /// 配置文件相关错误
    #[error("Configuration error: {0}")]
    Config(#[from] relay_common::ConfigError),

    // ========== 基础库错误 ==========
    /// Base crate 聚合错误
    #[error("Base library error: {0}")]
    Base(Box<relay_common::BaseError>),

    // ========== 服务相关错误 ==========
    /// 信令中继错误
    #[error("Signaling error: {0}")]
    Signaling(#[from] signaling::SignalingError),

    // ========== 系统级错误 ==========
    /// I/O 操作错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 后台任务错误
    #[error("Task error: {0}")]
    Join(#[from] tokio::task::JoinError),

    // ========== 业务逻辑错误 ==========
    /// 服务启动失败
    #[error("Service startup failed: {message}")]
    ServiceStartup { message: String },

    /// 服务配置验证失败
    #[error("Service configuration validation failed: {message}")]
    ServiceValidation { message: String },

    // ========== 通用错误 ==========
    /// 服务层使用 anyhow 返回的错误
    #[error("Service error: {0}")]
    Anyhow(#[from] anyhow::Error),

    /// 自定义错误消息
    #[error("Application error: {message}")]
    Custom { message: String },
}

impl From<relay_common::BaseError> for Error {
    fn from(err: relay_common::BaseError) -> Self {
        Error::Base(Box::new(err))
    }
}

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 创建自定义错误
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }

    /// 创建服务启动失败错误
    pub fn service_startup(message: impl Into<String>) -> Self {
        Self::ServiceStartup {
            message: message.into(),
        }
    }

    /// 创建服务配置验证失败错误
    pub fn service_validation(message: impl Into<String>) -> Self {
        Self::ServiceValidation {
            message: message.into(),
        }
    }
}
