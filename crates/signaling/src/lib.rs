//! 房间制 WebRTC 信令中继
//!
//! 客户端通过 WebSocket 连接后加入一个房间，中继在同房间成员之间转发
//! SDP offer / answer 与 ICE candidate，并广播成员进出事件。负载对中继不透明。
//!
//! # 模块结构
//!
//! ## 核心模块
//! - [`registry`]: 房间注册表，按房间加锁的成员管理
//! - [`session`]: 会话管理，出站序号与空闲检测
//! - [`router`]: 信令路由与成员关系校验
//! - [`supervisor`]: 空闲回收与断线清理
//! - [`relay`]: 组装以上组件的中继入口
//!
//! ## 传输
//! - [`message`]: JSON 线格式
//! - [`sink`]: 出站通道抽象
//! - [`server`] / [`axum_router`]: WebSocket 与 HTTP 接口
//! - [`events`]: SSE 事件流，供不能使用 WebSocket 的客户端接收信令
//! - [`ratelimit`]: 连接与消息速率限制

pub mod error;
pub mod events;
pub mod message;
pub mod ratelimit;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
pub mod sink;
pub mod supervisor;

// Axum router integration
pub mod axum_router;

pub use axum_router::{SESSION_HEADER, create_signaling_router, signaling_routes};

// Re-export commonly used types
pub use error::{ErrorKind, SignalingError};
pub use events::EventStreamSink;
pub use message::{MessageType, Relayed, RoomEventKind, SignalingMessage, WireMessage};
pub use registry::{RoomRegistry, RoomSummary};
pub use relay::{Relay, RelayStats};
pub use router::{EvictionReason, SignalingRouter};
pub use ratelimit::ConnectionPermit;
pub use server::SignalingServer;
pub use session::{SessionId, SessionManager};
pub use sink::{ChannelClosed, ChannelSink, MessageSink};
pub use supervisor::Supervisor;

// Export WebSocket handler
pub use server::handle_websocket_connection;
