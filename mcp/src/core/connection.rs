//! Supervised connection to one backend.
//!
//! State machine:
//!
//! ```text
//! Unconnected -> Connecting -> Ready -> Disconnecting -> Closed
//!                     |          |
//!                     +--> Errored <--+
//! ```
//!
//! Leaving `Ready` runs the detach hook while the state lock is held, so the
//! registry never observes a binding to a connection that is no longer ready.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, JsonObject};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::task::{task_tracker::TaskTrackerToken, TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    config::{BackendSpec, OutboundProxyConfig, TransportKind},
    handler::RefreshRequest,
    session::{BackendConnector, BackendSession, SessionContext, SessionError},
};
use crate::{
    error::{ProxyError, ProxyResult},
    inventory::ToolDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Ready,
    Disconnecting,
    Closed,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        })
    }
}

/// How a disconnect ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// In-flight calls drained within the grace period.
    Drained,
    /// The grace period elapsed and the session was terminated.
    Forced,
    /// Nothing to do.
    AlreadyClosed,
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub ready_since: Option<DateTime<Utc>>,
}

/// Per-connection settings resolved from the proxy configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub disconnect_grace: Duration,
    pub outbound_proxy: Option<OutboundProxyConfig>,
    pub refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(5),
            outbound_proxy: None,
            refresh_tx: None,
        }
    }
}

type DetachHook = Box<dyn Fn(&BackendConnection) + Send + Sync>;

struct LiveSession {
    session: Arc<dyn BackendSession>,
    in_flight: TaskTracker,
}

struct Inner {
    state: ConnectionState,
    live: Option<LiveSession>,
    tools: Vec<Arc<ToolDescriptor>>,
    last_error: Option<String>,
    ready_since: Option<DateTime<Utc>>,
}

pub struct BackendConnection {
    id: Uuid,
    spec: BackendSpec,
    connector: Arc<dyn BackendConnector>,
    settings: ConnectionSettings,
    call_permits: Option<Arc<Semaphore>>,
    on_detach: Option<DetachHook>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("name", &self.spec.name)
            .field("transport", &self.spec.transport)
            .field("state", &self.inner.try_lock().map(|inner| inner.state))
            .finish()
    }
}

impl BackendConnection {
    pub fn new(
        spec: BackendSpec,
        connector: Arc<dyn BackendConnector>,
        settings: ConnectionSettings,
    ) -> Self {
        let call_permits = spec
            .max_concurrent_calls
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            id: Uuid::new_v4(),
            spec,
            connector,
            settings,
            call_permits,
            on_detach: None,
            inner: Mutex::new(Inner {
                state: ConnectionState::Unconnected,
                live: None,
                tools: Vec::new(),
                last_error: None,
                ready_since: None,
            }),
        }
    }

    /// Run `hook` whenever the connection leaves `Ready`, under the state lock.
    #[must_use]
    pub fn with_detach_hook(
        mut self,
        hook: impl Fn(&BackendConnection) + Send + Sync + 'static,
    ) -> Self {
        self.on_detach = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.spec.kind()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Last tool list fetched from the backend.
    pub fn tools(&self) -> Vec<Arc<ToolDescriptor>> {
        self.inner.lock().tools.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn status(&self) -> BackendStatus {
        let inner = self.inner.lock();
        BackendStatus {
            name: self.spec.name.clone(),
            transport: self.spec.kind(),
            enabled: self.spec.enabled,
            state: inner.state,
            tool_count: inner.tools.len(),
            last_error: inner.last_error.clone(),
            ready_since: inner.ready_since,
        }
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        let previous = inner.state;
        inner.state = next;
        if previous == ConnectionState::Ready && next != ConnectionState::Ready {
            if let Some(hook) = &self.on_detach {
                hook(self);
            }
        }
        debug!(
            backend = %self.spec.name,
            from = %previous,
            to = %next,
            "Connection state changed"
        );
    }

    /// Bring the session up. A `Ready` or `Connecting` connection is left
    /// untouched and its current state returned.
    pub async fn connect(&self) -> ProxyResult<ConnectionState> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Ready | ConnectionState::Connecting => return Ok(inner.state),
                ConnectionState::Disconnecting => {
                    return Err(self.unavailable(ConnectionState::Disconnecting));
                }
                ConnectionState::Unconnected
                | ConnectionState::Closed
                | ConnectionState::Errored => {
                    self.transition(&mut inner, ConnectionState::Connecting);
                }
            }
        }

        let ctx = SessionContext {
            backend: self.spec.name.clone(),
            connect_timeout: self.settings.connect_timeout,
            outbound_proxy: self.settings.outbound_proxy.clone(),
            refresh_tx: self.settings.refresh_tx.clone(),
        };
        let attempt = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.spec, ctx),
        )
        .await;

        let result = match attempt {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(self.classify_connect_error(e)),
            Err(_) => Err(ProxyError::ConnectTimeout {
                backend: self.spec.name.clone(),
                timeout: self.settings.connect_timeout,
            }),
        };

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                let mut inner = self.inner.lock();
                if inner.state == ConnectionState::Connecting {
                    inner.last_error = Some(e.to_string());
                    self.transition(&mut inner, ConnectionState::Errored);
                }
                warn!(backend = %self.spec.name, error = %e, "Backend failed to connect");
                return Err(e);
            }
        };

        // A concurrent disconnect or abandon may have moved us out of Connecting.
        let stale = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connecting {
                inner.live = Some(LiveSession {
                    session: session.clone(),
                    in_flight: TaskTracker::new(),
                });
                inner.last_error = None;
                inner.ready_since = Some(Utc::now());
                self.transition(&mut inner, ConnectionState::Ready);
                None
            } else {
                Some(inner.state)
            }
        };

        match stale {
            None => {
                info!(
                    backend = %self.spec.name,
                    connection_id = %self.id,
                    transport = self.spec.transport.label(),
                    "Backend ready"
                );
                Ok(ConnectionState::Ready)
            }
            Some(state) => {
                session.close().await;
                Err(self.unavailable(state))
            }
        }
    }

    fn classify_connect_error(&self, err: SessionError) -> ProxyError {
        let backend = self.spec.name.clone();
        match err {
            SessionError::Launch(reason) => ProxyError::LaunchFailed { backend, reason },
            other => ProxyError::HandshakeFailed {
                backend,
                reason: other.to_string(),
            },
        }
    }

    /// Mark a connect that will never finish as failed.
    pub(crate) fn abandon_connect(&self, error: &ProxyError) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connecting {
            inner.last_error = Some(error.to_string());
            self.transition(&mut inner, ConnectionState::Errored);
        }
    }

    /// Run `f` only while the connection is `Ready`, holding the state lock.
    pub(crate) fn while_ready<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let inner = self.inner.lock();
        (inner.state == ConnectionState::Ready).then(f)
    }

    fn unavailable(&self, state: ConnectionState) -> ProxyError {
        ProxyError::BackendUnavailable {
            backend: self.spec.name.clone(),
            state,
        }
    }

    /// Session handle plus an in-flight token, only in `Ready`.
    fn acquire(&self) -> ProxyResult<(Arc<dyn BackendSession>, TaskTrackerToken)> {
        let inner = self.inner.lock();
        match (&inner.live, inner.state) {
            (Some(live), ConnectionState::Ready) => {
                Ok((live.session.clone(), live.in_flight.token()))
            }
            (_, state) => Err(self.unavailable(state)),
        }
    }

    /// Transport died under us: `Ready -> Errored` and drop the session.
    async fn lose_transport(&self, reason: String) -> ProxyError {
        let live = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Ready {
                inner.last_error = Some(reason.clone());
                let live = inner.live.take();
                self.transition(&mut inner, ConnectionState::Errored);
                live
            } else {
                None
            }
        };

        if let Some(live) = live {
            error!(backend = %self.spec.name, reason = %reason, "Backend transport lost");
            live.in_flight.close();
            live.session.close().await;
        }

        ProxyError::TransportLost {
            backend: self.spec.name.clone(),
            reason,
        }
    }

    /// Fetch the backend's tools and cache them as the last-known list.
    pub async fn list_tools(&self) -> ProxyResult<Vec<Arc<ToolDescriptor>>> {
        let (session, _in_flight) = self.acquire()?;

        match session.list_tools().await {
            Ok(tools) => {
                let descriptors: Vec<Arc<ToolDescriptor>> = tools
                    .into_iter()
                    .map(|tool| Arc::new(ToolDescriptor::new(&self.spec.name, tool)))
                    .collect();
                self.inner.lock().tools = descriptors.clone();
                debug!(
                    backend = %self.spec.name,
                    count = descriptors.len(),
                    "Listed backend tools"
                );
                Ok(descriptors)
            }
            Err(SessionError::TransportClosed(reason)) => Err(self.lose_transport(reason).await),
            Err(e) => Err(ProxyError::Protocol {
                backend: self.spec.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Forward a call verbatim to the backend.
    pub async fn call_tool(
        &self,
        local_name: &str,
        arguments: Option<JsonObject>,
    ) -> ProxyResult<CallToolResult> {
        let _permit = match &self.call_permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| self.unavailable(self.state()))?,
            ),
            None => None,
        };
        let (session, _in_flight) = self.acquire()?;

        match session.call_tool(local_name, arguments).await {
            Ok(result) => Ok(result),
            Err(SessionError::Remote {
                code,
                message,
                data,
            }) => Err(ProxyError::Backend {
                backend: self.spec.name.clone(),
                tool: local_name.to_string(),
                code,
                message,
                data,
            }),
            Err(SessionError::TransportClosed(reason)) => Err(self.lose_transport(reason).await),
            Err(e) => Err(ProxyError::Protocol {
                backend: self.spec.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Drain in-flight calls for the grace period, then close the session.
    pub async fn disconnect(&self) -> DisconnectOutcome {
        let live = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Unconnected
                | ConnectionState::Closed
                | ConnectionState::Disconnecting => return DisconnectOutcome::AlreadyClosed,
                ConnectionState::Connecting => {
                    // The pending connect sees this and closes its own session.
                    self.transition(&mut inner, ConnectionState::Closed);
                    return DisconnectOutcome::Drained;
                }
                ConnectionState::Ready | ConnectionState::Errored => {
                    let live = inner.live.take();
                    self.transition(&mut inner, ConnectionState::Disconnecting);
                    live
                }
            }
        };

        let mut outcome = DisconnectOutcome::Drained;
        if let Some(live) = live {
            live.in_flight.close();
            let grace = self.settings.disconnect_grace;
            if tokio::time::timeout(grace, live.in_flight.wait())
                .await
                .is_err()
            {
                warn!(
                    backend = %self.spec.name,
                    pending = live.in_flight.len(),
                    "Grace period elapsed with calls in flight, forcing close"
                );
                outcome = DisconnectOutcome::Forced;
            }
            if tokio::time::timeout(grace, live.session.close())
                .await
                .is_err()
            {
                warn!(backend = %self.spec.name, "Session close timed out");
                outcome = DisconnectOutcome::Forced;
            }
        }

        let mut inner = self.inner.lock();
        inner.ready_since = None;
        self.transition(&mut inner, ConnectionState::Closed);
        info!(backend = %self.spec.name, outcome = ?outcome, "Backend disconnected");
        outcome
    }

    /// Mark the connection `Closed` immediately and terminate any session
    /// still open in the background. Returns false if it was already closed.
    pub(crate) fn force_closed(&self) -> bool {
        let live = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                ConnectionState::Closed | ConnectionState::Unconnected
            ) {
                return false;
            }
            let live = inner.live.take();
            inner.ready_since = None;
            self.transition(&mut inner, ConnectionState::Closed);
            live
        };

        warn!(backend = %self.spec.name, "Backend force-closed");
        if let Some(live) = live {
            live.in_flight.close();
            tokio::spawn(async move { live.session.close().await });
        }
        true
    }
}
