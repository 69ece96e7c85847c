//! 配置相关错误类型
//!
//! 定义所有与配置解析、验证、加载相关的错误

use thiserror::Error;

/// 配置相关错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration format: {message}")]
    InvalidFormat { message: String },

    #[error("Invalid value for field '{field}': {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {source}")]
    ParseError {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_problem() {
        let err = ConfigError::Validation {
            errors: vec!["bind.http is required".to_string(), "bad env".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: bind.http is required; bad env"
        );
    }
}
