//! 服务管理器模块 - 负责管理多个服务的生命周期

use super::HttpRouterService;
use super::trace::http_trace_layer;
use anyhow::Result;
use axum::Router;
use relay_common::config::RelayConfig;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use url::Url;

/// 服务管理器，负责管理多个服务的生命周期
#[derive(Debug)]
pub struct ServiceManager {
    services: Vec<Box<dyn HttpRouterService>>,
    shutdown_tx: broadcast::Sender<()>,
    config: RelayConfig,
    local_addr: Option<SocketAddr>,
}

impl ServiceManager {
    /// 创建新的服务管理器
    pub fn new(config: RelayConfig, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            services: Vec::new(),
            shutdown_tx,
            config,
            local_addr: None,
        }
    }

    /// 添加服务到管理器
    pub fn add_service(&mut self, service: Box<dyn HttpRouterService>) {
        info!("Adding service '{}' to manager", service.info().name);
        self.services.push(service);
    }

    pub fn services(&self) -> impl Iterator<Item = &Box<dyn HttpRouterService>> {
        self.services.iter()
    }

    /// HTTP 服务器实际监听的地址（启动后可用）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// 启动所有服务，合并路由后绑定同一个 HTTP 监听端口
    pub async fn start_all(&mut self) -> Result<Vec<JoinHandle<()>>> {
        info!(
            "Starting all {} services ({})",
            self.services.len(),
            self.services
                .iter()
                .map(|s| s.info().service_type.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let http_config = self
            .config
            .bind
            .http
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No HTTP binding configuration found"))?;

        let bind_addr = http_config.bind_addr();
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{bind_addr}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to address '{addr}': {e}"))?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let public_url = Url::parse(&format!(
            "http://{}:{}",
            http_config.domain_name,
            local_addr.port()
        ))
        .map_err(|e| anyhow::anyhow!("Failed to parse HTTP URL: {e}"))?;

        // 构建合并的路由器
        let mut app = Router::new();
        for service in &mut self.services {
            let service_name = service.info().name.clone();
            let route_prefix = service.route_prefix().to_string();

            let router = match service.build_router().await {
                Ok(router) => router,
                Err(e) => {
                    error!(
                        "Failed to build router for service '{}': {:?}",
                        service_name, e
                    );
                    continue;
                }
            };

            info!(
                "Adding route '{}' for service '{}'",
                route_prefix, service_name
            );
            app = if route_prefix == "/" {
                app.merge(router)
            } else {
                app.nest(&route_prefix, router)
            };

            if let Err(e) = service.on_start(public_url.clone()).await {
                error!("Failed to start service '{}': {:?}", service_name, e);
            }
        }

        // 添加全局 Prometheus metrics 端点
        info!("Adding /metrics endpoint for Prometheus");
        app = app.route("/metrics", axum::routing::get(metrics_handler));

        app = app
            .layer(http_trace_layer())
            .layer(CorsLayer::permissive());

        info!("HTTP server listening on {}", local_addr);

        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("HTTP server received shutdown signal");
            });
            if let Err(e) = server.await {
                error!("HTTP server error: {}", e);
                let _ = shutdown_tx.send(());
            }
            info!("HTTP server stopped");
        });

        Ok(vec![handle])
    }

    /// Stop all services
    pub async fn stop_all(&mut self) -> Result<()> {
        info!("Stopping all services");

        let _ = self.shutdown_tx.send(());
        for service in &mut self.services {
            if let Err(e) = service.on_stop().await {
                error!("Failed to stop service '{}': {:?}", service.info().name, e);
            }
        }

        info!("All services stopped");
        Ok(())
    }
}

/// Prometheus metrics endpoint handler
async fn metrics_handler() -> String {
    relay_common::metrics::export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::SignalingService;
    use relay_common::config::HttpBindConfig;

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.env = "test".to_string();
        config.bind.http = Some(HttpBindConfig {
            domain_name: "127.0.0.1".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 0,
        });
        config
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let config = test_config();
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut manager = ServiceManager::new(config.clone(), shutdown_tx);
        manager.add_service(Box::new(SignalingService::new(config)));

        let handles = manager.start_all().await.unwrap();
        let addr = manager.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(manager.services().all(|s| s.info().is_running()));

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let metrics = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.is_empty() || metrics.contains("# "));

        manager.stop_all().await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(manager.services().all(|s| !s.info().is_running()));
    }

    #[tokio::test]
    async fn test_missing_http_binding() {
        let mut config = test_config();
        config.bind.http = None;
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut manager = ServiceManager::new(config, shutdown_tx);

        assert!(manager.start_all().await.is_err());
    }
}
