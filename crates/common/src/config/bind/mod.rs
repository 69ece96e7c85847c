pub mod http;

pub use crate::config::bind::http::HttpBindConfig;
use serde::{Deserialize, Serialize};

/// 网络绑定配置
///
/// 中继只暴露一个 HTTP 监听端口，WebSocket 升级与 HTTP 信令接口共用该端口。
/// TLS 由前置的反向代理终止。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BindConfig {
    /// HTTP 服务绑定配置
    pub http: Option<HttpBindConfig>,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            http: Some(HttpBindConfig::default()),
        }
    }
}
