//! Relay error taxonomy
//!
//! Every variant is recoverable and local to the request that caused it. Errors
//! are reported to the originating sender only, never to other room members.

use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// What a `NotFound` refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Resource {
    Session,
    Room,
}

/// Errors produced by the relay core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("room '{room_id}' is full (capacity {capacity})")]
    RoomFull { room_id: String, capacity: usize },

    #[error("{resource} '{id}' not found")]
    NotFound { resource: Resource, id: String },

    #[error("session is already in room '{room_id}'")]
    AlreadyInRoom { room_id: String },

    #[error("session is not in a room")]
    NotInRoom,

    #[error("target '{target}' is not a member of room '{room_id}'")]
    UnknownTarget { target: SessionId, room_id: String },

    #[error("channel closed for session '{0}'")]
    ChannelClosed(SessionId),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
}

/// Stable, wire-visible error kind
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
pub enum ErrorKind {
    RoomFull,
    NotFound,
    AlreadyInRoom,
    NotInRoom,
    UnknownTarget,
    ChannelClosed,
    ValidationError,
    RateLimited,
}

impl SignalingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomFull { .. } => ErrorKind::RoomFull,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyInRoom { .. } => ErrorKind::AlreadyInRoom,
            Self::NotInRoom => ErrorKind::NotInRoom,
            Self::UnknownTarget { .. } => ErrorKind::UnknownTarget,
            Self::ChannelClosed(_) => ErrorKind::ChannelClosed,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::RateLimited(_) => ErrorKind::RateLimited,
        }
    }

    pub fn session_not_found(id: &SessionId) -> Self {
        Self::NotFound {
            resource: Resource::Session,
            id: id.to_string(),
        }
    }

    pub fn room_not_found(room_id: &str) -> Self {
        Self::NotFound {
            resource: Resource::Room,
            id: room_id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SignalingError>;
