//! Backend connections and the proxy manager.

pub mod config;
pub mod connection;
pub mod handler;
mod http;
pub mod manager;
pub mod metrics;
pub mod session;

pub use config::{
    locate_config, BackendSpec, BackendTransport, NamingConfig, OutboundProxyConfig, ProxyConfig,
    RefreshConfig, TimeoutConfig, Tool, TransportKind, CONFIG_ENV_VAR,
};
pub use connection::{
    BackendConnection, BackendStatus, ConnectionSettings, ConnectionState, DisconnectOutcome,
};
pub use handler::{ProxyClientHandler, RefreshRequest};
pub use manager::{BoundTool, ProxyManager, StartReport, StopReport, ToolSnapshot};
pub use metrics::{LatencySnapshot, MetricsSnapshot, ProxyMetrics};
pub use session::{
    BackendConnector, BackendSession, RmcpConnector, RmcpSession, SessionContext, SessionError,
};
