//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mcp_proxy_core::{NamingConvention, ProxyConfig};

use crate::logging::LoggingConfig;

/// Serve the tools of many MCP servers as one MCP server.
#[derive(Debug, Parser)]
#[command(name = "mcp-proxy", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (falls back to $MCP_PROXY_CONFIG, ./config.yaml, ./config.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Naming convention: hierarchical, flat or both (overrides the file)
    #[arg(long, global = true)]
    pub naming: Option<NamingConvention>,

    /// Root segment of hierarchical names (overrides the file)
    #[arg(long, global = true)]
    pub namespace_root: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "MCP_PROXY_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "MCP_PROXY_LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Serve the aggregated tools over MCP stdio (default)
    Serve,

    /// Start every backend, print the registered tools, then exit
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Start every backend, call one tool, print the result, then exit
    Call {
        /// Caller-facing tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Validate the configuration without starting any backend
    Check,
}

impl Cli {
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json: self.log_json,
        }
    }

    /// Load the configuration file and apply flag overrides.
    pub async fn load_config(&self) -> anyhow::Result<ProxyConfig> {
        let config = ProxyConfig::load(self.config.as_deref()).await?;
        let config = self.apply_overrides(config);
        config.validate()?;
        Ok(config.with_env_proxy())
    }

    pub fn apply_overrides(&self, mut config: ProxyConfig) -> ProxyConfig {
        if let Some(naming) = self.naming {
            config.naming.convention = naming;
        }
        if let Some(root) = &self.namespace_root {
            config.naming.namespace_root = root.clone();
        }
        config
    }
}
