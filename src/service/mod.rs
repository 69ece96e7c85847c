//! 服务管理模块
//!
//! 提供通用的服务管理抽象：每个 HTTP 服务提供一个 axum 路由器，
//! 由 [`ServiceManager`] 合并到同一个 HTTP 服务器上并统一管理生命周期。
//!
//! ## 核心概念
//!
//! - `HttpRouterService`: HTTP路由服务的核心 trait，提供 axum 路由器
//! - `ServiceInfo`: 服务的基本信息
//! - `ServiceManager`: 服务管理器，负责管理多个服务的生命周期

pub mod info;
pub mod manager;
pub mod signaling;
pub mod trace;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use std::fmt::Debug;
use tracing::info;
use url::Url;

pub use info::{ServiceInfo, ServiceStatus, ServiceType};
pub use manager::ServiceManager;
pub use signaling::SignalingService;

/// HTTP路由服务的核心 trait - 为 axum 提供路由器
#[async_trait]
pub trait HttpRouterService: Send + Sync + Debug {
    /// 获取服务信息
    fn info(&self) -> &ServiceInfo;

    /// 获取可变的服务信息
    fn info_mut(&mut self) -> &mut ServiceInfo;

    /// 构建axum路由器
    async fn build_router(&mut self) -> Result<Router>;

    /// 服务启动回调（路由器已构建并启动后调用）
    async fn on_start(&mut self, base_url: Url) -> Result<()> {
        self.info_mut().set_running(base_url);
        Ok(())
    }

    /// 服务停止回调
    async fn on_stop(&mut self) -> Result<()> {
        info!("HTTP router service '{}' stopped", self.info().name);
        self.info_mut().status = ServiceStatus::Stopped;
        Ok(())
    }

    /// 获取路由前缀，"/" 表示挂载在根路径
    fn route_prefix(&self) -> &str;
}
