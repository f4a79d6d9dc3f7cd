//! In-memory backends for unit tests.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Content, ErrorCode, JsonObject, Tool};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{
    BackendConnector, BackendSession, BackendSpec, RefreshRequest, SessionContext, SessionError,
};

pub(crate) fn test_tool(name: &str) -> Tool {
    let mut schema = JsonObject::new();
    schema.insert("type".to_string(), serde_json::json!("object"));
    Tool::new(name.to_string(), format!("{name} tool"), schema)
}

#[derive(Default)]
struct BackendState {
    tools: Vec<String>,
    launch_error: Option<String>,
    handshake_error: Option<String>,
    list_error: Option<String>,
    connect_delay: Duration,
    call_delay: Duration,
    close_delay: Duration,
    dead: bool,
    kill_switch: CancellationToken,
    closed: bool,
    calls: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
    refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
    name: String,
}

/// Scriptable backend shared between the test and its sessions.
#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub(crate) fn new(tools: &[&str]) -> Self {
        let backend = Self::default();
        backend.set_tools(tools);
        backend
    }

    pub(crate) fn fail_launch(self, reason: &str) -> Self {
        self.state.lock().launch_error = Some(reason.to_string());
        self
    }

    pub(crate) fn fail_handshake(self, reason: &str) -> Self {
        self.state.lock().handshake_error = Some(reason.to_string());
        self
    }

    pub(crate) fn connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = delay;
        self
    }

    pub(crate) fn call_delay(self, delay: Duration) -> Self {
        self.state.lock().call_delay = delay;
        self
    }

    /// Make `close()` hang for `delay` before the session shuts down.
    pub(crate) fn close_delay(self, delay: Duration) -> Self {
        self.state.lock().close_delay = delay;
        self
    }

    pub(crate) fn set_tools(&self, tools: &[&str]) {
        self.state.lock().tools = tools.iter().map(|t| t.to_string()).collect();
    }

    pub(crate) fn fail_listing(&self, reason: &str) {
        self.state.lock().list_error = Some(reason.to_string());
    }

    pub(crate) fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.launch_error = None;
        state.handshake_error = None;
        state.list_error = None;
    }

    /// Simulate the process exiting: pending and future calls see a closed transport.
    pub(crate) fn kill(&self) {
        let mut state = self.state.lock();
        state.dead = true;
        state.kill_switch.cancel();
    }

    /// Announce `tools/list_changed` the way the rmcp client handler would.
    pub(crate) fn announce_list_changed(&self) {
        let state = self.state.lock();
        if let Some(tx) = &state.refresh_tx {
            let _ = tx.try_send(RefreshRequest {
                backend: state.name.clone(),
            });
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    backends: Arc<Mutex<HashMap<String, FakeBackend>>>,
    connects: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_backend(self, name: &str, backend: FakeBackend) -> Self {
        self.backends.lock().insert(name.to_string(), backend);
        self
    }

    pub(crate) fn connect_count(&self, name: &str) -> usize {
        self.connects.lock().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(
        &self,
        spec: &BackendSpec,
        ctx: SessionContext,
    ) -> Result<Arc<dyn BackendSession>, SessionError> {
        *self.connects.lock().entry(spec.name.clone()).or_default() += 1;
        let backend = self
            .backends
            .lock()
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| SessionError::Launch(format!("no such backend: {}", spec.name)))?;

        let delay = backend.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let kill_switch = {
            let mut state = backend.state.lock();
            if let Some(reason) = &state.launch_error {
                return Err(SessionError::Launch(reason.clone()));
            }
            if let Some(reason) = &state.handshake_error {
                return Err(SessionError::Handshake(reason.clone()));
            }
            state.dead = false;
            state.closed = false;
            state.kill_switch = CancellationToken::new();
            state.refresh_tx = ctx.refresh_tx.clone();
            state.name = ctx.backend.clone();
            state.kill_switch.clone()
        };

        Ok(Arc::new(FakeSession {
            backend,
            kill_switch,
            closed: CancellationToken::new(),
        }))
    }
}

struct FakeSession {
    backend: FakeBackend,
    kill_switch: CancellationToken,
    closed: CancellationToken,
}

impl FakeSession {
    fn check_alive(&self) -> Result<(), SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::TransportClosed("session closed".into()));
        }
        if self.kill_switch.is_cancelled() {
            return Err(SessionError::TransportClosed("backend exited".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendSession for FakeSession {
    async fn list_tools(&self) -> Result<Vec<Tool>, SessionError> {
        self.check_alive()?;
        let state = self.backend.state.lock();
        if let Some(reason) = &state.list_error {
            return Err(SessionError::Protocol(reason.clone()));
        }
        Ok(state.tools.iter().map(|name| test_tool(name)).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, SessionError> {
        self.check_alive()?;
        let (delay, known) = {
            let mut state = self.backend.state.lock();
            state.calls.push(name.to_string());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            (state.call_delay, state.tools.iter().any(|t| t == name))
        };
        let _in_flight = scopeguard::guard((), |_| {
            self.backend.state.lock().in_flight -= 1;
        });

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.closed.cancelled() => {}
                _ = self.kill_switch.cancelled() => {}
            }
        }
        self.check_alive()?;

        if !known {
            return Err(SessionError::Remote {
                code: ErrorCode::METHOD_NOT_FOUND.0,
                message: format!("unknown tool: {name}"),
                data: None,
            });
        }
        let echoed = arguments
            .map(|args| serde_json::Value::Object(args).to_string())
            .unwrap_or_default();
        Ok(CallToolResult::success(vec![Content::text(format!(
            "{name}({echoed})"
        ))]))
    }

    async fn close(&self) {
        let delay = self.backend.state.lock().close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.closed.cancel();
        self.backend.state.lock().closed = true;
    }
}
