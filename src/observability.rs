use crate::error::Result;
use relay_common::config::{LogConfig, RelayConfig};
use std::fs;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

const LOG_FILE_NAME: &str = "roomrelay.log";

/// Guard for the non-blocking log writer; dropping it flushes pending lines
#[derive(Default)]
pub struct ObservabilityGuard {
    log_guard: Option<WorkerGuard>,
}

impl ObservabilityGuard {
    pub fn is_file_logging(&self) -> bool {
        self.log_guard.is_some()
    }
}

/// Initialize logging based on configuration
pub fn init_observability(config: &RelayConfig) -> Result<ObservabilityGuard> {
    let mut guard = ObservabilityGuard::default();
    // RUST_LOG 优先于配置中的 filter_level
    let directive = config.get_filter_level();

    if config.is_console_logging() {
        init_subscriber_with_writer(std::io::stdout, true, &directive);
    } else {
        let log_config = config.log_config();
        fs::create_dir_all(&log_config.path)?;
        let (non_blocking, worker_guard) = build_file_writer(log_config)?;
        guard.log_guard = Some(worker_guard);

        init_subscriber_with_writer(non_blocking, false, &directive);
    }

    Ok(guard)
}

/// Create an EnvFilter from the configured directive, falling back to info
fn create_env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| {
        println!(
            "Failed to parse filter directive: {}. Falling back to default: info",
            directive
        );
        EnvFilter::new("info")
    })
}

fn init_subscriber_with_writer<W>(writer: W, use_ansi: bool, directive: &str)
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(use_ansi)
        .with_writer(writer);

    // 全局过滤器：事件先过滤，再交给 fmt layer
    tracing_subscriber::registry()
        .with(create_env_filter(directive))
        .with(fmt_layer)
        .try_init()
        .ok();
}

fn build_file_writer(log_config: &LogConfig) -> Result<(NonBlocking, WorkerGuard)> {
    println!("日志写入模式: 文件");
    println!("  - 路径: {}", log_config.path);
    println!(
        "  - 轮转: {}",
        if log_config.rotate {
            "开启（按天）"
        } else {
            "关闭"
        }
    );

    if log_config.rotate {
        let file_appender = tracing_appender::rolling::daily(&log_config.path, LOG_FILE_NAME);
        Ok(tracing_appender::non_blocking(file_appender))
    } else {
        let log_file_path = std::path::Path::new(&log_config.path).join(LOG_FILE_NAME);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path)?;
        Ok(tracing_appender::non_blocking(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_falls_back_to_info() {
        let filter = create_env_filter("info,[[[");
        assert_eq!(
            filter.max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::INFO)
        );
    }

    #[test]
    fn test_file_writer_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_config = LogConfig {
            output: "file".to_string(),
            rotate: false,
            path: dir.path().to_string_lossy().into_owned(),
        };

        let (_writer, _guard) = build_file_writer(&log_config).unwrap();
        assert!(dir.path().join(LOG_FILE_NAME).exists());
    }
}
