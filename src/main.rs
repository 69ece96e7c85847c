//! roomrelay 主程序
//!
//! 加载配置、初始化日志与指标，然后启动信令中继服务

mod cli;

use clap::Parser;
use relay_common::ConfigError;
use relay_common::config::RelayConfig;
use roomrelay::observability::init_observability;
use roomrelay::{Error, Result, ServiceManager, SignalingService};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

macro_rules! bootstrap_info {
    ($($arg:tt)*) => {
        println!($($arg)*);
    };
}

macro_rules! bootstrap_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

use cli::{Cli, Commands};

/// Application launcher utilities
struct ApplicationLauncher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Test { config_file }) => {
            let config_path =
                ApplicationLauncher::find_config_file(config_file.as_ref().unwrap_or(&cli.config))?;
            ApplicationLauncher::test_config_file(&config_path)
        }
        None => {
            let config_path = ApplicationLauncher::find_config_file(&cli.config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(ApplicationLauncher::run_application(&config_path))
        }
    }
}

impl ApplicationLauncher {
    /// Find config file with fallback locations
    fn find_config_file(provided_path: &PathBuf) -> Result<PathBuf> {
        // If the provided path is not the default "config.toml", it must exist
        if provided_path != Path::new("config.toml") {
            if provided_path.exists() {
                bootstrap_info!("Using provided config file: {:?}", provided_path);
                return Ok(provided_path.clone());
            } else {
                bootstrap_error!("Provided config file not found: {:?}", provided_path);
                return Err(Error::custom(format!(
                    "Config file not found: {provided_path:?}"
                )));
            }
        }

        let fallback_paths = [
            PathBuf::from("config.toml"),
            PathBuf::from("/etc/roomrelay/config.toml"),
        ];

        bootstrap_info!("Searching for config file in default locations...");

        for path in &fallback_paths {
            if path.exists() {
                bootstrap_info!("Found config file: {:?}", path);
                return Ok(path.clone());
            } else {
                bootstrap_info!("Config not found at: {:?}", path);
            }
        }

        bootstrap_error!("No configuration file found!");
        bootstrap_error!("Please create a config file in one of these locations:");
        for (i, path) in fallback_paths.iter().enumerate() {
            bootstrap_error!("  {}. {:?}", i + 1, path);
        }
        bootstrap_error!("Or specify a custom path with: roomrelay --config <path>");

        Err(Error::custom(
            "No configuration file found. Please create one or specify path with --config",
        ))
    }

    /// 测试配置文件是否有效
    fn test_config_file(config_path: &Path) -> Result<()> {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();

        let config = RelayConfig::from_file(config_path).map_err(|e| {
            error!("❌ 配置文件解析失败: {}", e);
            Error::service_validation(format!("配置解析失败: {e}"))
        })?;
        info!("✅ 配置文件解析成功: {:?}", config_path);

        if let Err(errors) = config.validate() {
            warn!("⚠️ 配置验证发现问题:");
            for (i, err) in errors.iter().enumerate() {
                if err.starts_with("Warning:") {
                    info!("  {}. ⚠️  {}", i + 1, err);
                } else {
                    error!("  {}. ❌ {}", i + 1, err);
                }
            }
            if errors.iter().any(|e| !e.starts_with("Warning:")) {
                return Err(Error::service_validation("配置验证失败"));
            }
        }

        info!("✅ 配置验证通过");
        Ok(())
    }

    /// 运行应用程序的主入口
    async fn run_application(config_path: &Path) -> Result<()> {
        bootstrap_info!("📄 加载配置文件: {:?}", config_path);

        let config = match RelayConfig::from_file(config_path) {
            Ok(config) => {
                bootstrap_info!("✅ 配置加载成功");

                if let Err(errors) = config.validate() {
                    bootstrap_error!("❌ 配置验证发现问题:");
                    let mut critical = Vec::new();
                    for (i, err) in errors.into_iter().enumerate() {
                        if err.starts_with("Warning:") {
                            bootstrap_info!("  {}. ⚠️  {}", i + 1, err);
                        } else {
                            bootstrap_error!("  {}. ❌ {}", i + 1, err);
                            critical.push(err);
                        }
                    }
                    if !critical.is_empty() {
                        return Err(ConfigError::Validation { errors: critical }.into());
                    }
                }

                config
            }
            Err(e) => {
                bootstrap_error!("❌ 配置加载失败: {}", e);
                return Err(e.into());
            }
        };

        // 初始化可观测性系统（日志）
        let observability_guard = init_observability(&config)?;
        if observability_guard.is_file_logging() {
            info!("📝 日志写入目录: {}", config.log_config().path);
        }

        Self::run_services(config).await
    }

    async fn run_services(config: RelayConfig) -> Result<()> {
        info!("🚀 启动信令中继 '{}' ({})", config.name, config.location_tag);

        // 全局关闭通道（供所有服务共享）
        let (shutdown_tx, _) = broadcast::channel::<()>(10);
        setup_ctrl_c_handler(shutdown_tx.clone());

        let mut service_manager = Self::create_service_manager(config.clone(), shutdown_tx.clone());
        let handle_futs: Vec<JoinHandle<()>> = service_manager
            .start_all()
            .await
            .map_err(|e| Error::service_startup(format!("{e:#}")))?;

        Self::display_service_info(&config, &service_manager);

        for handle in handle_futs {
            if let Err(e) = handle.await {
                error!("Service task terminated unexpectedly: {}", e);
                let _ = shutdown_tx.send(());
            }
        }
        service_manager.stop_all().await?;

        info!("🛑 所有服务已安全关闭");
        Ok(())
    }

    /// 创建服务管理器
    fn create_service_manager(
        config: RelayConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> ServiceManager {
        if let Err(e) = relay_common::metrics::register_metrics() {
            warn!(
                "Prometheus metrics registration warning (may already be registered): {}",
                e
            );
        }
        info!("✅ Prometheus metrics registry 初始化成功");

        info!("📊 计划启动的服务:");
        info!("  - Signaling Relay ({})", config.signaling.ws_path);

        let mut service_manager = ServiceManager::new(config.clone(), shutdown_tx);
        service_manager.add_service(Box::new(SignalingService::new(config)));
        service_manager
    }

    /// 显示服务信息
    fn display_service_info(config: &RelayConfig, manager: &ServiceManager) {
        info!("✅ 所有服务已启动");

        let (Some(http_config), Some(addr)) = (&config.bind.http, manager.local_addr()) else {
            info!("📡 没有配置 HTTP 服务器");
            return;
        };

        let http_url = format!("http://{}:{}", http_config.domain_name, addr.port());
        let ws_url = format!("ws://{}:{}", http_config.domain_name, addr.port());
        info!("📡 HTTP 服务器监听在: {} ({})", http_url, addr);
        info!("🔧 可用的API端点:");
        info!("  - {}{}", ws_url, config.signaling.ws_path);
        info!("  - {}/rooms/{{room_id}}/signal (POST)", http_url);
        info!("  - {}/rooms", http_url);
        info!("  - {}/health", http_url);
        info!("  - {}/metrics", http_url);
    }
}

/// 设置Ctrl-C信号处理程序
fn setup_ctrl_c_handler(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听Ctrl-C信号: {}", e);
            return;
        }
        info!("收到Ctrl-C信号，开始优雅关闭...");
        let _ = shutdown_tx.send(());
    });
}
