//! 服务信息

use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::info;
use url::Url;

/// 服务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
pub enum ServiceType {
    Signaling,
}

/// 服务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq, Default)]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Running,
    Stopped,
}

/// 服务基本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// 服务名称
    pub name: String,
    pub service_type: ServiceType,
    /// 对外地址，服务启动后设置
    pub url: Option<Url>,
    pub status: ServiceStatus,
    pub description: Option<String>,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        service_type: ServiceType,
        description: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_type,
            url: None,
            status: ServiceStatus::Unknown,
            description,
        }
    }

    pub fn set_running(&mut self, url: Url) {
        info!("Service '{}' running at {}", self.name, url);
        self.url = Some(url);
        self.status = ServiceStatus::Running;
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }
}
