//! 命令行界面定义
//!
//! 定义了主程序的命令行参数和选项
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "roomrelay")]
#[command(version)]
#[command(about = "Room-based WebRTC signaling relay")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Option<Commands>,

    /// Configuration file path (defaults to searching standard locations)
    #[arg(short, long, default_value = "config.toml")]
    pub(crate) config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Test configuration file
    Test {
        /// Configuration file path (optional, defaults to --config)
        #[arg(index = 1)]
        config_file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_test_command() {
        let cli = Cli::parse_from(["roomrelay", "test", "relay.toml"]);
        match cli.command {
            Some(Commands::Test { config_file }) => {
                assert_eq!(config_file, Some(PathBuf::from("relay.toml")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::parse_from(["roomrelay"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }
}
