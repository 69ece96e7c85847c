//! 信令消息与 JSON 线格式
//!
//! [`SignalingMessage`] 是中继内部使用的强类型消息；[`WireMessage`] 是扁平的
//! camelCase JSON 帧。解码时缺字段、未知类型或非法 JSON 一律视为
//! `ValidationError`；SDP / ICE 负载作为不透明的 JSON 值原样转发。

use crate::error::{ErrorKind, SignalingError};
use crate::session::SessionId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};
use tracing::error;

/// 线格式中的 `type` 字段
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MessageType {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
    RoomEvent,
    Welcome,
    Joined,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    /// 客户端允许发送的消息类型
    pub fn is_client_originated(self) -> bool {
        matches!(
            self,
            Self::Join | Self::Leave | Self::Offer | Self::Answer | Self::IceCandidate | Self::Ping
        )
    }
}

/// 房间事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum RoomEventKind {
    PeerJoined,
    PeerLeft,
}

/// 点对点转发的负载（offer / answer / ice-candidate）
#[derive(Debug, Clone, PartialEq)]
pub struct Relayed {
    pub target: SessionId,
    pub payload: Value,
}

/// 信令消息
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    Join {
        room_id: String,
        display_name: Option<String>,
    },
    Leave,
    Offer(Relayed),
    Answer(Relayed),
    IceCandidate(Relayed),
    RoomEvent {
        kind: RoomEventKind,
        session_id: SessionId,
        display_name: Option<String>,
    },
    Welcome {
        session_id: SessionId,
    },
    Joined {
        room_id: String,
        members: Vec<SessionId>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Ping,
    Pong,
}

impl SignalingMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Join { .. } => MessageType::Join,
            Self::Leave => MessageType::Leave,
            Self::Offer(_) => MessageType::Offer,
            Self::Answer(_) => MessageType::Answer,
            Self::IceCandidate(_) => MessageType::IceCandidate,
            Self::RoomEvent { .. } => MessageType::RoomEvent,
            Self::Welcome { .. } => MessageType::Welcome,
            Self::Joined { .. } => MessageType::Joined,
            Self::Error { .. } => MessageType::Error,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
        }
    }

    /// 发送给请求方的错误帧
    pub fn error(err: &SignalingError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// 解码客户端帧，拒绝服务端专用的消息类型
    pub fn decode_client(frame: &[u8]) -> Result<Self, SignalingError> {
        let message = Self::decode(frame)?;
        let message_type = message.message_type();
        if !message_type.is_client_originated() {
            return Err(SignalingError::validation(format!(
                "'{message_type}' messages are generated by the server"
            )));
        }
        Ok(message)
    }

    /// 解码任意方向的帧
    pub fn decode(frame: &[u8]) -> Result<Self, SignalingError> {
        let wire: WireMessage = serde_json::from_slice(frame)
            .map_err(|e| SignalingError::validation(format!("malformed frame: {e}")))?;
        Self::try_from(wire)
    }

    /// 编码为一帧 JSON
    ///
    /// `from` 只在转发的消息上出现，`seq` 由会话在投递时分配。
    pub fn encode(&self, from: Option<&SessionId>, seq: Option<u64>) -> Bytes {
        let mut wire = WireMessage::from(self);
        wire.from = from.cloned();
        wire.seq = seq;
        match serde_json::to_vec(&wire) {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                error!("❌ 消息 {} 编码失败: {}", wire.message_type, e);
                Bytes::new()
            }
        }
    }
}

/// 扁平 JSON 帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<SessionId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl WireMessage {
    fn bare(message_type: MessageType) -> Self {
        Self {
            message_type,
            room_id: None,
            display_name: None,
            target: None,
            from: None,
            payload: None,
            kind: None,
            session_id: None,
            members: None,
            message: None,
            seq: None,
        }
    }

    fn required<T>(
        value: Option<T>,
        message_type: MessageType,
        field: &str,
    ) -> Result<T, SignalingError> {
        value.ok_or_else(|| {
            SignalingError::validation(format!("'{message_type}' requires field '{field}'"))
        })
    }

    fn relayed(self) -> Result<Relayed, SignalingError> {
        let message_type = self.message_type;
        let target = Self::required(self.target, message_type, "target")?;
        if target.as_str().is_empty() {
            return Err(SignalingError::validation(format!(
                "'{message_type}' requires a non-empty target"
            )));
        }
        // JSON null 会被反序列化为 None
        let payload = Self::required(self.payload, message_type, "payload")?;
        Ok(Relayed { target, payload })
    }
}

impl From<&SignalingMessage> for WireMessage {
    fn from(message: &SignalingMessage) -> Self {
        let mut wire = Self::bare(message.message_type());
        match message {
            SignalingMessage::Join {
                room_id,
                display_name,
            } => {
                wire.room_id = Some(room_id.clone());
                wire.display_name = display_name.clone();
            }
            SignalingMessage::Offer(relayed)
            | SignalingMessage::Answer(relayed)
            | SignalingMessage::IceCandidate(relayed) => {
                wire.target = Some(relayed.target.clone());
                wire.payload = Some(relayed.payload.clone());
            }
            SignalingMessage::RoomEvent {
                kind,
                session_id,
                display_name,
            } => {
                wire.kind = Some(kind.to_string());
                wire.session_id = Some(session_id.clone());
                wire.display_name = display_name.clone();
            }
            SignalingMessage::Welcome { session_id } => {
                wire.session_id = Some(session_id.clone());
            }
            SignalingMessage::Joined { room_id, members } => {
                wire.room_id = Some(room_id.clone());
                wire.members = Some(members.clone());
            }
            SignalingMessage::Error { kind, message } => {
                wire.kind = Some(kind.to_string());
                wire.message = Some(message.clone());
            }
            SignalingMessage::Leave | SignalingMessage::Ping | SignalingMessage::Pong => {}
        }
        wire
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = SignalingError;

    fn try_from(wire: WireMessage) -> Result<Self, SignalingError> {
        let message_type = wire.message_type;
        let message = match message_type {
            MessageType::Join => Self::Join {
                room_id: WireMessage::required(wire.room_id, message_type, "roomId")?,
                display_name: wire.display_name,
            },
            MessageType::Leave => Self::Leave,
            MessageType::Offer => Self::Offer(wire.relayed()?),
            MessageType::Answer => Self::Answer(wire.relayed()?),
            MessageType::IceCandidate => Self::IceCandidate(wire.relayed()?),
            MessageType::RoomEvent => {
                let kind = WireMessage::required(wire.kind, message_type, "kind")?;
                Self::RoomEvent {
                    kind: RoomEventKind::from_str(&kind).map_err(|_| {
                        SignalingError::validation(format!("unknown room event kind '{kind}'"))
                    })?,
                    session_id: WireMessage::required(wire.session_id, message_type, "sessionId")?,
                    display_name: wire.display_name,
                }
            }
            MessageType::Welcome => Self::Welcome {
                session_id: WireMessage::required(wire.session_id, message_type, "sessionId")?,
            },
            MessageType::Joined => Self::Joined {
                room_id: WireMessage::required(wire.room_id, message_type, "roomId")?,
                members: wire.members.unwrap_or_default(),
            },
            MessageType::Error => {
                let kind = WireMessage::required(wire.kind, message_type, "kind")?;
                Self::Error {
                    kind: ErrorKind::from_str(&kind).map_err(|_| {
                        SignalingError::validation(format!("unknown error kind '{kind}'"))
                    })?,
                    message: wire.message.unwrap_or_default(),
                }
            }
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
        };
        Ok(message)
    }
}
