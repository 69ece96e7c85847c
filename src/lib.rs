//! # roomrelay
//!
//! 房间制 WebRTC 信令中继服务器：进程入口、可观测性初始化与 HTTP 服务管理

pub mod error;
pub mod observability;
pub mod service;

// Re-export commonly used types
pub use error::{Error, Result};
pub use relay_common::config::RelayConfig;
pub use service::{HttpRouterService, ServiceManager, SignalingService};
