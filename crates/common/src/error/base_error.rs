//! 顶层错误枚举
//!
//! 聚合 relay-common 内部的错误类型

use super::ConfigError;
use thiserror::Error;

/// relay-common 的顶层错误
#[derive(Error, Debug)]
pub enum BaseError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 指标注册或导出错误
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, BaseError>;
