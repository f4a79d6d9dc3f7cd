//! MCP stdio server over the proxy manager.
//!
//! Re-exposes every registered caller-facing name through `tools/list` and
//! routes `tools/call` to the owning backend.

use std::sync::Arc;

use mcp_proxy_core::{ProxyError, ProxyManager};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, ErrorCode, ErrorData, JsonObject,
        ListToolsResult, PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    transport::stdio,
    RoleServer, ServerHandler, ServiceExt,
};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ProxyServer {
    manager: Arc<ProxyManager>,
}

impl ProxyServer {
    pub fn new(manager: Arc<ProxyManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ProxyManager> {
        &self.manager
    }

    /// Every registered tool under its caller-facing name.
    pub fn tools(&self) -> Vec<Tool> {
        self.manager
            .get_all_tools()
            .iter()
            .map(|bound| bound.tool())
            .collect()
    }

    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.manager.call_tool(name, arguments).await {
            Ok(result) => Ok(result),
            Err(e) => {
                debug!(tool = %name, error = %e, "Tool call failed");
                call_error(e)
            }
        }
    }
}

/// Map a proxy error onto the MCP response.
///
/// Unknown tools are invalid params; backend JSON-RPC errors pass through
/// with their code; an unreachable backend is a tool-level error the client
/// can show to the model.
pub fn call_error(err: ProxyError) -> Result<CallToolResult, ErrorData> {
    match err {
        ProxyError::ToolNotFound(name) => Err(ErrorData::invalid_params(
            format!("Tool not found: {name}"),
            None,
        )),
        ProxyError::Backend {
            code,
            message,
            data,
            ..
        } => Err(ErrorData::new(ErrorCode(code), message, data)),
        e @ (ProxyError::TransportLost { .. }
        | ProxyError::BackendUnavailable { .. }
        | ProxyError::Protocol { .. }) => Ok(CallToolResult::error(vec![Content::text(
            e.to_string(),
        )])),
        other => Err(ErrorData::internal_error(other.to_string(), None)),
    }
}

impl ServerHandler for ProxyServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "mcp-proxy".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.instructions = Some(format!(
            "Aggregated tools from {} backend(s). Hierarchical names are rooted at '{}'.",
            self.manager.config().backends.len(),
            self.manager.translator().namespace_root()
        ));
        info
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult::with_all_items(self.tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.dispatch(&request.name, request.arguments).await
    }
}

/// Serve over stdin/stdout until the client disconnects or a shutdown
/// signal arrives.
pub async fn serve_stdio(manager: Arc<ProxyManager>) -> anyhow::Result<()> {
    let service = ProxyServer::new(manager).serve(stdio()).await?;
    info!("Serving MCP over stdio");

    tokio::select! {
        quit = service.waiting() => match quit {
            Ok(reason) => info!(reason = ?reason, "Client session ended"),
            Err(e) => warn!(error = %e, "Server task failed"),
        },
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
