//! roomrelay 基础设施库
//!
//! 为信令中继提供配置模型、错误类型与 Prometheus 指标

pub mod config;
pub mod error;
pub mod metrics;

pub use config::RelayConfig;
pub use error::{BaseError, ConfigError, Result};
