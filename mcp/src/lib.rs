//! MCP proxy core.
//!
//! Aggregates several MCP backends behind one tool surface.
//!
//! ## Modules
//!
//! - [`core`]: configuration, backend connections, and the [`ProxyManager`]
//! - [`inventory`]: caller-facing name registry
//! - [`naming`]: hierarchical and flat tool naming

pub mod core;
pub mod error;
pub mod inventory;
pub mod naming;

#[cfg(test)]
mod test_utils;

pub use core::{
    BackendConnection, BackendConnector, BackendSession, BackendSpec, BackendStatus,
    BackendTransport, BoundTool, ConnectionState, LatencySnapshot, MetricsSnapshot,
    OutboundProxyConfig, ProxyConfig, ProxyManager, SessionContext, SessionError, StartReport,
    StopReport, Tool, ToolSnapshot, TransportKind,
};
pub use error::{BackendFailure, ProxyError, ProxyResult};
pub use inventory::{CollisionEvent, QualifiedToolName, ToolDescriptor, ToolRegistry};
pub use naming::{NameForm, NamingConvention, ToolNameTranslator};
