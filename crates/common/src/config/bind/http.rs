use serde::{Deserialize, Serialize};

/// HTTP 服务绑定配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpBindConfig {
    /// 域名
    ///
    /// 用于在启动日志中打印客户端可用的 ws:// 与 http:// 地址。
    #[serde(default = "default_domain_name")]
    pub domain_name: String,

    /// 绑定 IP 地址
    ///
    /// 通常使用 "0.0.0.0" 监听所有接口。
    pub ip: String,

    /// 绑定端口，0 表示由系统分配
    pub port: u16,
}

fn default_domain_name() -> String {
    "localhost".to_string()
}

impl HttpBindConfig {
    /// 监听地址字符串，形如 `0.0.0.0:8080`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl Default for HttpBindConfig {
    fn default() -> Self {
        Self {
            domain_name: default_domain_name(),
            ip: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}
