//! Axum Router 集成
//!
//! 提供信令中继的 HTTP 入口：
//! - `GET {ws_path}`: WebSocket 升级，一个 socket 对应一个会话
//! - `GET /events`: SSE 事件流，一条流对应一个会话，配合 signal 接口发送
//! - `POST /rooms/{room_id}/signal`: 以 `x-session-id` 头标识的会话发送一条信令
//! - `GET /rooms`: 房间统计
//! - `GET /health`: 健康检查

use crate::error::{ErrorKind, SignalingError};
use crate::events::open_event_stream;
use crate::message::{MessageType, SignalingMessage, WireMessage};
use crate::ratelimit::ConnectionPermit;
use crate::server::{SignalingServer, handle_websocket_connection};
use crate::session::SessionId;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, State,
        rejection::JsonRejection,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use relay_common::config::signaling::SignalingConfig;
use serde_json::json;
use std::net::SocketAddr;
use tracing::{error, info, warn};

/// 标识 HTTP 请求所属会话的请求头
pub const SESSION_HEADER: &str = "x-session-id";

/// Signaling Server 状态（用于 Axum State）
#[derive(Clone)]
pub struct SignalingState {
    pub server: SignalingServer,
}

/// 创建 Signaling Axum Router
///
/// 返回可挂载的 Router 以及服务器句柄（用于关闭时清理会话）
pub fn create_signaling_router(config: &SignalingConfig) -> (Router, SignalingServer) {
    info!("Creating Signaling Axum router (ws path: {})", config.ws_path);

    let server = SignalingServer::new(config.clone());
    let router = signaling_routes(server.clone());

    info!("Signaling Axum router created successfully");
    (router, server)
}

/// 基于已有服务器构建路由
pub fn signaling_routes(server: SignalingServer) -> Router {
    let ws_path = server.config.ws_path.clone();
    let state = SignalingState { server };

    Router::new()
        .route(&ws_path, get(websocket_handler))
        .route("/events", get(events_handler))
        .route("/rooms", get(rooms_handler))
        .route("/rooms/{room_id}/signal", post(signal_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// WebSocket 升级处理器
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let client_ip = addr.ip();

    // 检查连接速率限制，许可随连接一起存活
    let permit = match state.server.acquire_connection(client_ip).await {
        Ok(permit) => permit,
        Err(e) => {
            warn!("🚫 IP {} 连接速率限制触发: {}", client_ip, e);
            return error_response(&e);
        }
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, permit))
}

/// WebSocket 连接处理
async fn handle_websocket(socket: WebSocket, state: SignalingState, permit: ConnectionPermit) {
    let client_ip = permit.ip();
    info!("📡 新 WebSocket 连接: IP={}", client_ip);

    if let Err(e) = handle_websocket_connection(socket, state.server, Some(client_ip)).await {
        error!("WebSocket connection error: {}", e);
    }

    drop(permit);
}

/// SSE 事件流处理器
async fn events_handler(
    State(state): State<SignalingState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let client_ip = addr.ip();

    let permit = match state.server.acquire_connection(client_ip).await {
        Ok(permit) => permit,
        Err(e) => {
            warn!("🚫 IP {} 连接速率限制触发: {}", client_ip, e);
            return error_response(&e);
        }
    };

    match open_event_stream(state.server, permit).await {
        Ok((_, stream)) => Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(e) => {
            error!("无法打开 SSE 事件流: {}", e);
            error_response(&e)
        }
    }
}

/// 通过 HTTP 发送一条信令
async fn signal_handler(
    State(state): State<SignalingState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<WireMessage>, JsonRejection>,
) -> Response {
    match signal(&state.server, &room_id, &headers, payload).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn signal(
    server: &SignalingServer,
    room_id: &str,
    headers: &HeaderMap,
    payload: Result<Json<WireMessage>, JsonRejection>,
) -> Result<(), SignalingError> {
    let session_id = session_from_headers(headers)?;
    let session = server.relay.sessions().get(&session_id).await?;

    let Json(mut wire) = payload
        .map_err(|e| SignalingError::validation(format!("invalid body: {}", e.body_text())))?;

    if !wire.message_type.is_client_originated() {
        return Err(SignalingError::validation(format!(
            "'{}' messages are generated by the server",
            wire.message_type
        )));
    }

    // join 使用路径中的房间 ID
    if wire.message_type == MessageType::Join {
        match wire.room_id.as_deref() {
            Some(body_room) if body_room != room_id => {
                return Err(SignalingError::validation(format!(
                    "body roomId '{body_room}' does not match path '{room_id}'"
                )));
            }
            Some(_) => {}
            None => wire.room_id = Some(room_id.to_string()),
        }
    }

    let message = SignalingMessage::try_from(wire)?;
    server.check_message_rate(&session_id).await?;

    match &message {
        SignalingMessage::Join { .. } | SignalingMessage::Ping => {}
        SignalingMessage::Leave => {
            // 未加入时 leave 是空操作；在别的房间则拒绝
            if let Some(current) = session.room_id().await
                && current != room_id
            {
                return Err(SignalingError::NotInRoom);
            }
        }
        _ => {
            if session.room_id().await.as_deref() != Some(room_id) {
                if !server.relay.registry().contains_room(room_id).await {
                    return Err(SignalingError::room_not_found(room_id));
                }
                return Err(SignalingError::NotInRoom);
            }
        }
    }

    server.relay.dispatch(&session_id, message).await
}

fn session_from_headers(headers: &HeaderMap) -> Result<SessionId, SignalingError> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(SessionId::from)
        .ok_or_else(|| SignalingError::validation(format!("missing {SESSION_HEADER} header")))
}

/// 房间统计
async fn rooms_handler(State(state): State<SignalingState>) -> Response {
    Json(state.server.relay.stats().await).into_response()
}

/// 健康检查
async fn health_handler(State(state): State<SignalingState>) -> Response {
    Json(json!({
        "status": "ok",
        "sessions": state.server.relay.sessions().session_count().await,
    }))
    .into_response()
}

/// 错误类型对应的 HTTP 状态码
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound | ErrorKind::UnknownTarget => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyInRoom | ErrorKind::NotInRoom | ErrorKind::RoomFull => {
            StatusCode::CONFLICT
        }
        ErrorKind::ChannelClosed => StatusCode::GONE,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
    }
}

fn error_response(err: &SignalingError) -> Response {
    let kind = err.kind();
    (
        status_for(kind),
        Json(json!({
            "status": "error",
            "kind": kind.as_ref(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}
