//! Backend session seam.
//!
//! A [`BackendSession`] is one live protocol client; a [`BackendConnector`]
//! produces sessions from a [`BackendSpec`]. [`RmcpConnector`] is the
//! production connector for stdio, SSE and streamable HTTP backends.

use std::{borrow::Cow, sync::Arc, time::Duration};

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, JsonObject},
    service::{ClientInitializeError, Peer, RunningService, ServiceError},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    config::{BackendSpec, BackendTransport, OutboundProxyConfig, Tool},
    handler::{ProxyClientHandler, RefreshRequest},
    http::build_http_client,
};

/// Failure reported by a session or connector.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The process could not be spawned or the socket could not be opened.
    #[error("{0}")]
    Launch(String),

    /// The transport opened but the protocol initialization failed.
    #[error("{0}")]
    Handshake(String),

    #[error("{0}")]
    Protocol(String),

    /// The underlying process or stream is gone.
    #[error("{0}")]
    TransportClosed(String),

    /// JSON-RPC error returned by the backend.
    #[error("error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },
}

/// What a connector needs besides the backend spec.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub backend: String,
    pub connect_timeout: Duration,
    pub outbound_proxy: Option<OutboundProxyConfig>,
    /// Where `tools/list_changed` notifications are forwarded
    pub refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
}

#[async_trait]
pub trait BackendSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>, SessionError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, SessionError>;

    /// Terminate the session. Must be safe to call more than once.
    async fn close(&self);
}

#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        spec: &BackendSpec,
        ctx: SessionContext,
    ) -> Result<Arc<dyn BackendSession>, SessionError>;
}

/// Type alias for a backend client with handler
type BackendClient = RunningService<RoleClient, ProxyClientHandler>;

/// rmcp client session.
pub struct RmcpSession {
    peer: Peer<RoleClient>,
    service: Mutex<Option<BackendClient>>,
}

impl RmcpSession {
    fn new(service: BackendClient) -> Self {
        Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl BackendSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<Tool>, SessionError> {
        self.peer.list_all_tools().await.map_err(map_service_error)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, SessionError> {
        let request = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        };
        self.peer.call_tool(request).await.map_err(map_service_error)
    }

    async fn close(&self) {
        let service = self.service.lock().take();
        if let Some(service) = service {
            if let Err(e) = service.cancel().await {
                warn!(error = %e, "Error while closing backend session");
            }
        }
    }
}

fn map_service_error(err: ServiceError) -> SessionError {
    let message = err.to_string();
    match err {
        ServiceError::McpError(data) => SessionError::Remote {
            code: data.code.0,
            message: data.message.into_owned(),
            data: data.data,
        },
        ServiceError::TransportClosed | ServiceError::TransportSend { .. } => {
            SessionError::TransportClosed(message)
        }
        _ => SessionError::Protocol(message),
    }
}

/// Connection failures on a persistent stream that are worth retrying.
fn map_stream_init_error(err: ClientInitializeError) -> SessionError {
    let message = err.to_string();
    match err {
        ClientInitializeError::TransportError { .. }
        | ClientInitializeError::ConnectionClosed { .. } => SessionError::Launch(message),
        _ => SessionError::Handshake(message),
    }
}

/// Connector backed by `rmcp` transports.
#[derive(Debug, Clone)]
pub struct RmcpConnector {
    initial_retry_interval: Duration,
    max_retry_interval: Duration,
}

impl RmcpConnector {
    pub fn new() -> Self {
        Self {
            initial_retry_interval: Duration::from_millis(500),
            max_retry_interval: Duration::from_secs(10),
        }
    }

    async fn connect_stdio(
        &self,
        spec: &BackendSpec,
        handler: ProxyClientHandler,
    ) -> Result<BackendClient, SessionError> {
        let BackendTransport::Stdio {
            command,
            args,
            envs,
            cwd,
        } = &spec.transport
        else {
            return Err(SessionError::Launch(format!(
                "backend '{}' is not a stdio backend",
                spec.name
            )));
        };

        let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(
            |cmd| {
                cmd.args(args)
                    .envs(envs.iter())
                    .stderr(std::process::Stdio::inherit());
                if let Some(dir) = cwd {
                    cmd.current_dir(dir);
                }
            },
        ))
        .map_err(|e| SessionError::Launch(format!("spawn '{}': {}", command, e)))?;

        let client = handler
            .serve(transport)
            .await
            .map_err(|e| SessionError::Handshake(format!("initialize stdio client: {}", e)))?;

        info!(backend = %spec.name, command = %command, "Connected to stdio backend");
        Ok(client)
    }

    async fn connect_stream_once(
        spec: &BackendSpec,
        handler: ProxyClientHandler,
        http_client: reqwest::Client,
    ) -> Result<BackendClient, SessionError> {
        match &spec.transport {
            BackendTransport::Sse { url, .. } => {
                let cfg = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(http_client, cfg)
                    .await
                    .map_err(|e| SessionError::Launch(format!("open SSE stream: {}", e)))?;
                handler.serve(transport).await.map_err(map_stream_init_error)
            }
            BackendTransport::Streamable { url, .. } => {
                let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let transport = StreamableHttpClientTransport::with_client(http_client, cfg);
                handler.serve(transport).await.map_err(map_stream_init_error)
            }
            BackendTransport::Stdio { .. } => Err(SessionError::Launch(format!(
                "backend '{}' is not a network backend",
                spec.name
            ))),
        }
    }

    /// Connect with exponential backoff, bounded by the connect timeout
    async fn connect_stream(
        &self,
        spec: &BackendSpec,
        handler: ProxyClientHandler,
        ctx: &SessionContext,
    ) -> Result<BackendClient, SessionError> {
        let (token, headers) = match &spec.transport {
            BackendTransport::Sse { token, headers, .. }
            | BackendTransport::Streamable { token, headers, .. } => (token.as_deref(), headers),
            BackendTransport::Stdio { .. } => {
                return Err(SessionError::Launch(format!(
                    "backend '{}' is not a network backend",
                    spec.name
                )))
            }
        };
        let http_client = build_http_client(ctx.outbound_proxy.as_ref(), token, headers)
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_retry_interval)
            .with_max_interval(self.max_retry_interval)
            .with_max_elapsed_time(Some(ctx.connect_timeout))
            .build();

        let client = backoff::future::retry(backoff, move || {
            let handler = handler.clone();
            let http_client = http_client.clone();
            async move {
                match Self::connect_stream_once(spec, handler, http_client).await {
                    Ok(client) => Ok(client),
                    Err(e @ SessionError::Launch(_)) => {
                        warn!(backend = %spec.name, error = %e, "Failed to connect, retrying");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        warn!(
                            backend = %spec.name,
                            error = %e,
                            "Permanent connect error, not retrying"
                        );
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        })
        .await?;

        info!(
            backend = %spec.name,
            transport = spec.transport.label(),
            "Connected to network backend"
        );
        Ok(client)
    }
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendConnector for RmcpConnector {
    async fn connect(
        &self,
        spec: &BackendSpec,
        ctx: SessionContext,
    ) -> Result<Arc<dyn BackendSession>, SessionError> {
        debug!(backend = %spec.name, transport = ?spec.transport, "Connecting to backend");

        let mut handler = ProxyClientHandler::new(&ctx.backend);
        if let Some(tx) = ctx.refresh_tx.clone() {
            handler = handler.with_refresh_channel(tx);
        }

        let client = match &spec.transport {
            BackendTransport::Stdio { .. } => self.connect_stdio(spec, handler).await?,
            BackendTransport::Sse { .. } | BackendTransport::Streamable { .. } => {
                self.connect_stream(spec, handler, &ctx).await?
            }
        };
        Ok(Arc::new(RmcpSession::new(client)))
    }
}
