//! MCP proxy front end: CLI, logging, and the stdio server over
//! [`mcp_proxy_core::ProxyManager`].

pub mod cli;
pub mod commands;
pub mod logging;
pub mod server;

pub use cli::{Cli, Command};
pub use server::ProxyServer;
