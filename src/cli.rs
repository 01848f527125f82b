//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Session-scoped MCP transport: JSON-RPC over POST, push over SSE
#[derive(Parser, Debug)]
#[command(name = "mcp-session-transport")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_TRANSPORT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_TRANSPORT_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_TRANSPORT_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_TRANSPORT_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_TRANSPORT_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the transport server (default)
    Serve,

    /// Load and validate the configuration, then print it with secrets redacted
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["mcp-session-transport"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_check_config_with_path() {
        let cli = Cli::try_parse_from([
            "mcp-session-transport",
            "check-config",
            "--config",
            "transport.yaml",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("transport.yaml")));
    }

    #[test]
    fn test_port_override() {
        let cli = Cli::try_parse_from(["mcp-session-transport", "--port", "9000", "serve"]).unwrap();
        assert_eq!(cli.port, Some(9000));
        assert!(matches!(cli.command, Some(Command::Serve)));
    }
}
