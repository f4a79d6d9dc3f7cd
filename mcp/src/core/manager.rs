//! Proxy manager.
//!
//! Owns every backend connection, brings them up concurrently, publishes
//! their tools under caller-facing names and routes calls back to the
//! originating backend.
//!
//! Lifecycle:
//! - `start()`: connect and discover all enabled backends in one wave,
//!   bounded by the startup deadline
//! - `call_tool()`: resolve a caller-facing name and forward the call
//! - `refresh_backend()`: re-list one backend (manual, periodic, or on
//!   `tools/list_changed`)
//! - `stop()`: disconnect everything under the shutdown deadline

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::future::join_all;
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, JsonObject};
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    config::{ProxyConfig, Tool},
    connection::{
        BackendConnection, BackendStatus, ConnectionSettings, ConnectionState, DisconnectOutcome,
    },
    handler::RefreshRequest,
    metrics::{LatencySnapshot, MetricsSnapshot, ProxyMetrics},
    session::{BackendConnector, RmcpConnector},
};
use crate::{
    error::{BackendFailure, ProxyError, ProxyResult},
    inventory::{CollisionEvent, QualifiedToolName, RegistryEntry, ToolDescriptor, ToolRegistry},
    naming::{NameForm, ToolNameTranslator},
};

/// Pending `tools/list_changed` refreshes before new ones are dropped
const REFRESH_QUEUE_DEPTH: usize = 64;

/// Outcome of `start()`.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    /// Every configured backend, in configuration order
    pub backends: Vec<BackendStatus>,
    /// Enabled backends that did not come up, in configuration order
    pub failures: Vec<BackendFailure>,
    pub registered_tools: usize,
}

impl StartReport {
    pub fn ready_count(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.state == ConnectionState::Ready)
            .count()
    }

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Outcome of `stop()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    /// Backends whose in-flight calls drained in time
    pub closed: Vec<String>,
    /// Backends terminated after their grace period or the shutdown deadline
    pub forced: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

/// A registered tool bound to its backend, callable directly.
#[derive(Clone)]
pub struct BoundTool {
    entry: Arc<RegistryEntry>,
    metrics: Arc<ProxyMetrics>,
}

impl BoundTool {
    fn new(entry: Arc<RegistryEntry>, metrics: Arc<ProxyMetrics>) -> Self {
        Self { entry, metrics }
    }

    /// Caller-facing name
    pub fn name(&self) -> &str {
        self.entry.caller_name()
    }

    pub fn form(&self) -> NameForm {
        self.entry.form()
    }

    pub fn backend(&self) -> &str {
        self.entry.backend()
    }

    pub fn local_name(&self) -> &str {
        self.entry.local_name()
    }

    pub fn descriptor(&self) -> &Arc<ToolDescriptor> {
        self.entry.descriptor()
    }

    /// The backend's tool definition under its caller-facing name.
    pub fn tool(&self) -> Tool {
        self.entry.descriptor().exposed_as(self.entry.caller_name())
    }

    /// Forward a call to the bound backend. No retries.
    pub async fn call(&self, arguments: Option<JsonObject>) -> ProxyResult<CallToolResult> {
        let qualified = self.entry.qualified_name();
        debug!(
            tool = %self.entry.caller_name(),
            backend = %qualified.backend,
            local_name = %qualified.tool_name,
            "Routing tool call"
        );

        self.metrics.record_call_start(&qualified);
        let mut outcome = scopeguard::guard((Instant::now(), false), |(started, ok)| {
            self.metrics
                .record_call_end(&qualified, ok, started.elapsed().as_millis() as u64);
        });

        let result = self
            .entry
            .connection()
            .call_tool(self.entry.local_name(), arguments)
            .await;

        match &result {
            Ok(res) => outcome.1 = res.is_error != Some(true),
            Err(ProxyError::TransportLost { .. }) => self.metrics.record_transport_lost(),
            Err(_) => {}
        }
        result
    }
}

impl std::fmt::Debug for BoundTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTool")
            .field("name", &self.name())
            .field("backend", &self.backend())
            .field("local_name", &self.local_name())
            .finish()
    }
}

/// Owned, ordered view of every registered tool.
#[derive(Debug, Clone, Default)]
pub struct ToolSnapshot {
    tools: Vec<BoundTool>,
    by_name: HashMap<String, usize>,
}

impl ToolSnapshot {
    fn new(tools: Vec<BoundTool>) -> Self {
        let by_name = tools
            .iter()
            .enumerate()
            .map(|(idx, tool)| (tool.name().to_string(), idx))
            .collect();
        Self { tools, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&BoundTool> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(BoundTool::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundTool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl IntoIterator for ToolSnapshot {
    type Item = BoundTool;
    type IntoIter = std::vec::IntoIter<BoundTool>;

    fn into_iter(self) -> Self::IntoIter {
        self.tools.into_iter()
    }
}

enum Discovery {
    Listed(Vec<Arc<ToolDescriptor>>),
    ListFailed(ProxyError),
    ConnectFailed(ProxyError),
}

/// State shared with background refresh tasks.
struct Shared {
    translator: ToolNameTranslator,
    registry: Arc<ToolRegistry>,
    connections: Vec<Arc<BackendConnection>>,
    metrics: Arc<ProxyMetrics>,
}

impl Shared {
    fn connection(&self, name: &str) -> Option<&Arc<BackendConnection>> {
        self.connections.iter().find(|c| c.name() == name)
    }

    /// Register `tools` for a connection that is still `Ready`. The state
    /// lock is held across the registry write.
    fn publish(
        &self,
        connection: &Arc<BackendConnection>,
        tools: &[Arc<ToolDescriptor>],
    ) -> Option<usize> {
        connection.while_ready(|| {
            let entries = tools
                .iter()
                .flat_map(|desc| {
                    self.translator
                        .translate(desc.backend(), desc.name())
                        .into_iter()
                        .map(move |caller| {
                            RegistryEntry::new(
                                caller.name,
                                caller.form,
                                connection.clone(),
                                desc.clone(),
                            )
                        })
                })
                .collect();
            self.registry.replace_for(connection.id(), entries)
        })
    }

    async fn refresh_backend(&self, name: &str) -> ProxyResult<usize> {
        let connection = self
            .connection(name)
            .ok_or_else(|| ProxyError::BackendNotFound(name.to_string()))?;

        let tools = connection.list_tools().await?;
        self.apply_refresh(connection, &tools)
    }

    fn apply_refresh(
        &self,
        connection: &Arc<BackendConnection>,
        tools: &[Arc<ToolDescriptor>],
    ) -> ProxyResult<usize> {
        let registered =
            self.publish(connection, tools)
                .ok_or_else(|| ProxyError::BackendUnavailable {
                    backend: connection.name().to_string(),
                    state: connection.state(),
                })?;
        info!(
            backend = %connection.name(),
            tools = tools.len(),
            names = registered,
            "Refreshed backend tools"
        );
        Ok(registered)
    }

    /// List every ready backend concurrently, then publish the results in
    /// configuration order.
    async fn refresh_all(&self) {
        let ready: Vec<&Arc<BackendConnection>> =
            self.connections.iter().filter(|c| c.is_ready()).collect();
        let listed = join_all(ready.iter().map(|connection| connection.list_tools())).await;

        for (connection, result) in ready.into_iter().zip(listed) {
            if let Err(e) = result.and_then(|tools| self.apply_refresh(connection, &tools)) {
                warn!(backend = %connection.name(), error = %e, "Background refresh failed");
            }
        }
    }
}

pub struct ProxyManager {
    config: ProxyConfig,
    shared: Arc<Shared>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    refresh_rx: Mutex<Option<mpsc::Receiver<RefreshRequest>>>,
    shutdown_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    periodic_refresh_started: AtomicBool,
}

impl ProxyManager {
    /// Manager over the rmcp transports.
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        Self::with_connector(config, Arc::new(RmcpConnector::new()))
    }

    pub fn with_connector(
        config: ProxyConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> ProxyResult<Self> {
        config.validate()?;

        let translator = ToolNameTranslator::new(
            config.naming.convention,
            config.naming.namespace_root.clone(),
        );
        let registry = Arc::new(ToolRegistry::new());
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE_DEPTH);

        let connections = config
            .backends
            .iter()
            .map(|spec| {
                let settings = ConnectionSettings {
                    connect_timeout: spec.connect_timeout(&config.timeouts),
                    disconnect_grace: spec.disconnect_grace(&config.timeouts),
                    outbound_proxy: config.proxy_for(spec).cloned(),
                    refresh_tx: config.refresh.on_list_changed.then(|| refresh_tx.clone()),
                };
                let registry = Arc::downgrade(&registry);
                Arc::new(
                    BackendConnection::new(spec.clone(), connector.clone(), settings)
                        .with_detach_hook(move |connection| {
                            if let Some(registry) = registry.upgrade() {
                                registry.unregister_all_for(connection);
                            }
                        }),
                )
            })
            .collect();

        Ok(Self {
            config,
            shared: Arc::new(Shared {
                translator,
                registry,
                connections,
                metrics: Arc::new(ProxyMetrics::new()),
            }),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            shutdown_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            periodic_refresh_started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn translator(&self) -> &ToolNameTranslator {
        &self.shared.translator
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.shared.registry
    }

    pub fn backend(&self, name: &str) -> Option<Arc<BackendConnection>> {
        self.shared.connection(name).cloned()
    }

    /// Connect every enabled backend and register its tools.
    ///
    /// Succeeds when at least one backend is ready. Backends that fail are
    /// listed in the report; when all fail the result is
    /// [`ProxyError::NoBackendsAvailable`].
    pub async fn start(&self) -> ProxyResult<StartReport> {
        let enabled: Vec<(usize, Arc<BackendConnection>)> = self
            .shared
            .connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.spec().enabled)
            .map(|(idx, c)| (idx, c.clone()))
            .collect();

        if enabled.is_empty() {
            info!("No backends configured, nothing to start");
            self.spawn_background_tasks();
            return Ok(self.report(Vec::new()));
        }

        let startup = self.config.timeouts.startup();
        info!(
            backends = enabled.len(),
            startup_timeout = ?startup,
            "Starting backends"
        );
        let deadline = tokio::time::Instant::now() + startup;

        let mut tasks = JoinSet::new();
        for (idx, connection) in &enabled {
            let (idx, connection) = (*idx, connection.clone());
            tasks.spawn(async move {
                let discovery = match connection.connect().await {
                    Ok(_) => match connection.list_tools().await {
                        Ok(tools) => Discovery::Listed(tools),
                        Err(e) => Discovery::ListFailed(e),
                    },
                    Err(e) => Discovery::ConnectFailed(e),
                };
                (idx, connection, discovery)
            });
        }

        let mut completed = HashSet::new();
        let mut failures: Vec<(usize, BackendFailure)> = Vec::new();
        let mut deadline_hit = false;

        loop {
            let first = match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    break;
                }
            };

            // Everything that finished in the same wake-up registers in
            // configuration order.
            let mut batch = vec![first];
            while let Some(joined) = tasks.try_join_next() {
                batch.push(joined);
            }
            let mut finished: Vec<_> = batch
                .into_iter()
                .filter_map(|joined| match joined {
                    Ok(done) => Some(done),
                    Err(e) => {
                        error!(error = %e, "Backend startup task failed");
                        None
                    }
                })
                .collect();
            finished.sort_by_key(|(idx, _, _)| *idx);

            for (idx, connection, discovery) in finished {
                completed.insert(idx);
                if let Some(failure) = self.register_discovery(&connection, discovery) {
                    failures.push((idx, failure));
                }
            }
        }

        if deadline_hit {
            warn!(timeout = ?startup, "Startup deadline reached, abandoning pending backends");
        }
        tasks.shutdown().await;

        for (idx, connection) in &enabled {
            if completed.contains(idx) {
                continue;
            }
            if connection.is_ready() {
                // Connected but discovery did not finish in time.
                warn!(
                    backend = %connection.name(),
                    "Tool discovery unfinished at startup deadline, queueing refresh"
                );
                self.queue_refresh(connection.name());
                continue;
            }
            let err = if deadline_hit {
                ProxyError::ConnectTimeout {
                    backend: connection.name().to_string(),
                    timeout: startup,
                }
            } else {
                ProxyError::LaunchFailed {
                    backend: connection.name().to_string(),
                    reason: "startup task ended unexpectedly".to_string(),
                }
            };
            connection.abandon_connect(&err);
            self.shared.metrics.record_connection_error();
            failures.push((*idx, BackendFailure::new(connection.name(), err.to_string())));
        }

        failures.sort_by_key(|(idx, _)| *idx);
        let failures: Vec<BackendFailure> = failures.into_iter().map(|(_, f)| f).collect();

        let ready = enabled.iter().filter(|(_, c)| c.is_ready()).count();
        if ready == 0 {
            error!(failed = failures.len(), "No backend could be started");
            return Err(ProxyError::NoBackendsAvailable(failures));
        }

        self.spawn_background_tasks();
        let report = self.report(failures);
        for status in &report.backends {
            info!(
                backend = %status.name,
                state = %status.state,
                enabled = status.enabled,
                tools = status.tool_count,
                error = status.last_error.as_deref().unwrap_or(""),
                "Backend status"
            );
        }
        info!(
            ready,
            failed = report.failures.len(),
            registered_tools = report.registered_tools,
            "Proxy started"
        );
        Ok(report)
    }

    /// Ask the refresh listener to re-list `backend`. Returns false when the
    /// queue is full or closed.
    fn queue_refresh(&self, backend: &str) -> bool {
        match self.refresh_tx.try_send(RefreshRequest {
            backend: backend.to_string(),
        }) {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = %backend, error = %e, "Failed to queue tool refresh");
                false
            }
        }
    }

    /// Register one backend's discovery result; returns its failure, if any.
    fn register_discovery(
        &self,
        connection: &Arc<BackendConnection>,
        discovery: Discovery,
    ) -> Option<BackendFailure> {
        match discovery {
            Discovery::Listed(tools) => match self.shared.publish(connection, &tools) {
                Some(registered) => {
                    info!(
                        backend = %connection.name(),
                        tools = tools.len(),
                        names = registered,
                        "Registered backend tools"
                    );
                    None
                }
                None => Some(BackendFailure::new(
                    connection.name(),
                    connection
                        .last_error()
                        .unwrap_or_else(|| format!("backend left ready state ({})", connection.state())),
                )),
            },
            Discovery::ListFailed(e) => {
                warn!(backend = %connection.name(), error = %e, "Tool discovery failed");
                if matches!(e, ProxyError::TransportLost { .. }) {
                    self.shared.metrics.record_transport_lost();
                }
                (!connection.is_ready()).then(|| BackendFailure::new(connection.name(), e.to_string()))
            }
            Discovery::ConnectFailed(e) => {
                self.shared.metrics.record_connection_error();
                Some(BackendFailure::new(connection.name(), e.to_string()))
            }
        }
    }

    fn report(&self, failures: Vec<BackendFailure>) -> StartReport {
        StartReport {
            backends: self.status(),
            failures,
            registered_tools: self.shared.registry.len(),
        }
    }

    /// Every registered caller-facing name bound to its callable.
    pub fn get_all_tools(&self) -> ToolSnapshot {
        ToolSnapshot::new(
            self.shared
                .registry
                .snapshot()
                .into_iter()
                .map(|entry| BoundTool::new(entry, self.shared.metrics.clone()))
                .collect(),
        )
    }

    /// Find the entry for a caller-facing name, trying alternative
    /// spellings when the exact name is not registered.
    pub fn resolve(&self, caller_name: &str) -> Option<Arc<RegistryEntry>> {
        let registry = &self.shared.registry;
        if let Some(entry) = registry.lookup(caller_name) {
            return Some(entry);
        }
        self.shared
            .translator
            .resolution_candidates(caller_name)
            .into_iter()
            .find_map(|candidate| {
                let entry = registry.lookup(&candidate)?;
                debug!(requested = %caller_name, resolved = %candidate, "Resolved tool alias");
                Some(entry)
            })
    }

    pub async fn call_tool(
        &self,
        caller_name: &str,
        arguments: Option<JsonObject>,
    ) -> ProxyResult<CallToolResult> {
        let Some(entry) = self.resolve(caller_name) else {
            self.shared.metrics.record_unresolved_call();
            return Err(ProxyError::ToolNotFound(caller_name.to_string()));
        };
        BoundTool::new(entry, self.shared.metrics.clone())
            .call(arguments)
            .await
    }

    /// Re-list one backend's tools and swap its registrations.
    pub async fn refresh_backend(&self, name: &str) -> ProxyResult<usize> {
        self.shared.refresh_backend(name).await
    }

    /// Refresh every ready backend on a fixed interval until `stop()`.
    pub fn spawn_background_refresh(&self, interval: Duration) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let token = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => shared.refresh_all().await,
                }
            }
            debug!("Background refresh stopped");
        })
    }

    fn spawn_background_tasks(&self) {
        let mut background = self.background.lock();

        if let Some(rx) = self.refresh_rx.lock().take() {
            let shared = self.shared.clone();
            let token = self.shutdown_token.clone();
            background.push(tokio::spawn(run_refresh_listener(shared, rx, token)));
        }

        if let Some(interval) = self.config.refresh.interval() {
            if self.periodic_refresh_started.swap(true, Ordering::AcqRel) {
                return;
            }
            info!(interval = ?interval, "Starting background refresh");
            background.push(self.spawn_background_refresh(interval));
        }
    }

    /// Disconnect every backend. Always completes within the shutdown
    /// deadline.
    pub async fn stop(&self) -> StopReport {
        self.shutdown_token.cancel();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        let shutdown = self.config.timeouts.shutdown();
        info!(timeout = ?shutdown, "Stopping backends");

        let mut tasks = JoinSet::new();
        for connection in &self.shared.connections {
            let connection = connection.clone();
            tasks.spawn(async move {
                let outcome = connection.disconnect().await;
                (connection.name().to_string(), outcome)
            });
        }

        let mut report = StopReport::default();
        let drained = tokio::time::timeout(shutdown, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, DisconnectOutcome::Drained)) => report.closed.push(name),
                    Ok((name, DisconnectOutcome::Forced)) => report.forced.push(name),
                    Ok((_, DisconnectOutcome::AlreadyClosed)) => {}
                    Err(e) => error!(error = %e, "Disconnect task failed"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown deadline reached, forcing remaining backends closed");
            tasks.abort_all();
            for connection in &self.shared.connections {
                if connection.force_closed() {
                    report.forced.push(connection.name().to_string());
                }
            }
        }

        info!(
            closed = report.closed.len(),
            forced = report.forced.len(),
            "Proxy stopped"
        );
        report
    }

    /// Status of every configured backend, including disabled ones.
    pub fn status(&self) -> Vec<BackendStatus> {
        self.shared.connections.iter().map(|c| c.status()).collect()
    }

    pub fn collisions(&self) -> Vec<CollisionEvent> {
        self.shared.registry.collisions()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let ready = self
            .shared
            .connections
            .iter()
            .filter(|c| c.is_ready())
            .count();
        self.shared.metrics.snapshot(ready as u64)
    }

    pub fn tool_latency(&self, tool: &QualifiedToolName) -> Option<LatencySnapshot> {
        self.shared.metrics.tool_latency(tool)
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

async fn run_refresh_listener(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<RefreshRequest>,
    token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = token.cancelled() => break,
            request = rx.recv() => request,
        };
        let Some(request) = request else {
            break;
        };

        // Coalesce notifications that queued up meanwhile.
        let mut pending = vec![request.backend];
        while let Ok(more) = rx.try_recv() {
            if !pending.contains(&more.backend) {
                pending.push(more.backend);
            }
        }

        for backend in pending {
            if let Err(e) = shared.refresh_backend(&backend).await {
                warn!(backend = %backend, error = %e, "Refresh after list change failed");
            }
        }
    }
    debug!("Refresh listener stopped");
}
