//! 信令中继服务实现

use crate::service::{HttpRouterService, ServiceInfo, ServiceType};
use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use relay_common::config::RelayConfig;
use signaling::{SignalingServer, create_signaling_router};
use tracing::info;
use url::Url;

/// 房间制信令中继服务
///
/// 挂载在根路径：`{ws_path}`、`/rooms`、`/rooms/{room_id}/signal`、`/health`
#[derive(Debug)]
pub struct SignalingService {
    info: ServiceInfo,
    config: RelayConfig,
    server: Option<SignalingServer>,
}

impl SignalingService {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            info: ServiceInfo::new(
                "Signaling Relay",
                ServiceType::Signaling,
                Some("Room-based WebRTC signaling relay over WebSocket".to_string()),
            ),
            config,
            server: None,
        }
    }

    /// 路由构建后可用的服务器句柄
    pub fn server(&self) -> Option<&SignalingServer> {
        self.server.as_ref()
    }
}

#[async_trait]
impl HttpRouterService for SignalingService {
    fn info(&self) -> &ServiceInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ServiceInfo {
        &mut self.info
    }

    async fn build_router(&mut self) -> Result<Router> {
        info!("Building Signaling router");
        let (router, server) = create_signaling_router(&self.config.signaling);
        self.server = Some(server);

        info!("Signaling router built successfully");
        Ok(router)
    }

    async fn on_start(&mut self, base_url: Url) -> Result<()> {
        let ws_url = ws_url(&base_url, &self.config.signaling.ws_path)?;
        info!("📡 Signaling WebSocket endpoint: {}", ws_url);
        self.info.set_running(base_url);
        Ok(())
    }

    async fn on_stop(&mut self) -> Result<()> {
        if let Some(server) = self.server.take() {
            server.relay.shutdown().await;
        }
        self.info.status = crate::service::ServiceStatus::Stopped;
        info!("Signaling service stopped");
        Ok(())
    }

    fn route_prefix(&self) -> &str {
        "/"
    }
}

fn ws_url(base_url: &Url, ws_path: &str) -> Result<Url> {
    let mut url = base_url.join(ws_path)?;
    let scheme = if base_url.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot derive WebSocket URL from {base_url}"))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        let base = Url::parse("http://localhost:8080").unwrap();
        assert_eq!(
            ws_url(&base, "/ws").unwrap().as_str(),
            "ws://localhost:8080/ws"
        );
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut service = SignalingService::new(RelayConfig::default());
        assert!(service.server().is_none());
        assert_eq!(service.route_prefix(), "/");

        service.build_router().await.unwrap();
        assert!(service.server().is_some());

        service
            .on_start(Url::parse("http://127.0.0.1:8080").unwrap())
            .await
            .unwrap();
        assert!(service.info().is_running());

        service.on_stop().await.unwrap();
        assert!(service.server().is_none());
        assert!(!service.info().is_running());
    }
}
