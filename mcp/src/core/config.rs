//! Proxy configuration types and loading.
//!
//! Defines the backend list, naming selection, timeouts, refresh policy and
//! outbound HTTP proxy settings, plus YAML file discovery and validation.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

pub use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{ProxyError, ProxyResult},
    naming::{NamingConvention, DEFAULT_NAMESPACE_ROOT},
};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "MCP_PROXY_CONFIG";

/// File names probed in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["config.yaml", "config.yml"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Caller-facing naming convention
    #[serde(default)]
    pub naming: NamingConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Tool list refresh settings
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Outbound HTTP(S) proxy for persistent-stream backends.
    /// Can be overridden per backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_proxy: Option<OutboundProxyConfig>,

    /// Backends in declaration order
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamingConfig {
    #[serde(default)]
    pub convention: NamingConvention,

    /// First segment of every hierarchical name
    #[serde(default = "default_namespace_root")]
    pub namespace_root: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Per-backend bound on reaching `Ready`
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Overall bound on `start()`
    #[serde(default = "default_startup_secs")]
    pub startup_secs: u64,

    /// How long `disconnect()` waits for in-flight calls
    #[serde(default = "default_disconnect_grace_secs")]
    pub disconnect_grace_secs: u64,

    /// Overall bound on `stop()`
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    /// Background refresh interval (seconds), 0 disables it
    #[serde(default)]
    pub interval_secs: u64,

    /// Re-list a backend's tools when it announces `tools/list_changed`
    #[serde(default = "default_true")]
    pub on_list_changed: bool,
}

impl RefreshConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// One backend server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendSpec {
    pub name: String,

    #[serde(flatten)]
    pub transport: BackendTransport,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-backend outbound proxy (overrides the global one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<OutboundProxyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_grace_secs: Option<u64>,

    /// Limit on concurrent in-flight calls to this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_calls: Option<usize>,
}

impl BackendSpec {
    pub fn new(name: impl Into<String>, transport: BackendTransport) -> Self {
        Self {
            name: name.into(),
            transport,
            enabled: true,
            proxy: None,
            connect_timeout_secs: None,
            disconnect_grace_secs: None,
            max_concurrent_calls: None,
        }
    }

    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            BackendTransport::Stdio {
                command: command.into(),
                args: Vec::new(),
                envs: HashMap::new(),
                cwd: None,
            },
        )
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn connect_timeout(&self, defaults: &TimeoutConfig) -> Duration {
        self.connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| defaults.connect())
    }

    pub fn disconnect_grace(&self, defaults: &TimeoutConfig) -> Duration {
        self.disconnect_grace_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| defaults.disconnect_grace())
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum BackendTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
        /// Working directory for the child process
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    Sse {
        url: String,
        /// Bearer token for Authorization header
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Additional headers (e.g., X-API-Key)
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    Streamable {
        url: String,
        /// Bearer token for Authorization header
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Additional headers (e.g., X-API-Key)
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl BackendTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            BackendTransport::Stdio { .. } => TransportKind::ChildProcess,
            BackendTransport::Sse { .. } | BackendTransport::Streamable { .. } => {
                TransportKind::PersistentStream
            }
        }
    }

    /// Short label used in logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            BackendTransport::Stdio { .. } => "stdio",
            BackendTransport::Sse { .. } => "sse",
            BackendTransport::Streamable { .. } => "streamable",
        }
    }
}

impl fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTransport::Stdio {
                command,
                args,
                envs,
                cwd,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .field("cwd", cwd)
                .finish(),
            BackendTransport::Sse {
                url,
                token,
                headers,
            } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
            BackendTransport::Streamable {
                url,
                token,
                headers,
            } => f
                .debug_struct("Streamable")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    ChildProcess,
    PersistentStream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::ChildProcess => "child-process",
            TransportKind::PersistentStream => "persistent-stream",
        })
    }
}

/// Outbound proxy for backend HTTP traffic
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct OutboundProxyConfig {
    /// HTTP proxy URL (e.g., "http://proxy.internal:8080")
    #[serde(default)]
    pub http: Option<String>,

    /// HTTPS proxy URL
    #[serde(default)]
    pub https: Option<String>,

    /// Comma-separated hosts to exclude from proxying
    /// Example: "localhost,127.0.0.1,*.internal"
    #[serde(default)]
    pub no_proxy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for OutboundProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundProxyConfig")
            .field("http", &self.http)
            .field("https", &self.https)
            .field("no_proxy", &self.no_proxy)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl OutboundProxyConfig {
    /// Load proxy settings from the standard environment variables
    pub fn from_env() -> Option<Self> {
        let http = std::env::var("MCP_HTTP_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTP_PROXY").ok());

        let https = std::env::var("MCP_HTTPS_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTPS_PROXY").ok());

        let no_proxy = std::env::var("MCP_NO_PROXY")
            .ok()
            .or_else(|| std::env::var("NO_PROXY").ok());

        if http.is_some() || https.is_some() {
            Some(Self {
                http,
                https,
                no_proxy,
                username: None,
                password: None,
            })
        } else {
            None
        }
    }
}

fn default_namespace_root() -> String {
    DEFAULT_NAMESPACE_ROOT.to_string()
}

fn default_connect_secs() -> u64 {
    30
}

fn default_startup_secs() -> u64 {
    60
}

fn default_disconnect_grace_secs() -> u64 {
    5
}

fn default_shutdown_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            convention: NamingConvention::default(),
            namespace_root: default_namespace_root(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            startup_secs: default_startup_secs(),
            disconnect_grace_secs: default_disconnect_grace_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            on_list_changed: true,
        }
    }
}

impl ProxyConfig {
    pub fn with_backends(backends: Vec<BackendSpec>) -> Self {
        Self {
            backends,
            ..Default::default()
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> ProxyResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a YAML file
    pub async fn from_file(path: impl AsRef<Path>) -> ProxyResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Resolve and load the configuration file. With no file anywhere the
    /// default configuration (no backends) is returned.
    pub async fn load(explicit: Option<&Path>) -> ProxyResult<Self> {
        let cwd = std::env::current_dir()?;
        let env_value = std::env::var(CONFIG_ENV_VAR).ok();
        match locate_config(&cwd, explicit, env_value.as_deref()) {
            Some(path) => {
                debug!(path = %path.display(), "Loading proxy configuration");
                Self::from_file(&path).await
            }
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Fill the global outbound proxy from the environment when unset
    pub fn with_env_proxy(mut self) -> Self {
        if self.outbound_proxy.is_none() {
            self.outbound_proxy = OutboundProxyConfig::from_env();
        }
        self
    }

    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendSpec> {
        self.backends.iter().filter(|b| b.enabled)
    }

    /// Outbound proxy for a backend. Priority: backend.proxy > global.
    pub fn proxy_for<'a>(&'a self, spec: &'a BackendSpec) -> Option<&'a OutboundProxyConfig> {
        spec.proxy.as_ref().or(self.outbound_proxy.as_ref())
    }

    pub fn validate(&self) -> ProxyResult<()> {
        let root = &self.naming.namespace_root;
        if root.trim().is_empty() {
            return Err(ProxyError::Config(
                "naming.namespace_root must not be empty".to_string(),
            ));
        }
        if root.contains('.') || root.chars().any(char::is_whitespace) {
            return Err(ProxyError::Config(format!(
                "naming.namespace_root '{root}' must not contain '.' or whitespace"
            )));
        }

        let mut seen = HashSet::new();
        for spec in &self.backends {
            validate_backend(spec)?;
            if !seen.insert(spec.name.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate backend name '{}'",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

fn validate_backend(spec: &BackendSpec) -> ProxyResult<()> {
    let name = &spec.name;
    if name.is_empty() {
        return Err(ProxyError::Config("backend name must not be empty".into()));
    }
    if name.contains('.') || name.chars().any(char::is_whitespace) {
        return Err(ProxyError::Config(format!(
            "backend name '{name}' must not contain '.' or whitespace"
        )));
    }
    if spec.max_concurrent_calls == Some(0) {
        return Err(ProxyError::Config(format!(
            "backend '{name}': max_concurrent_calls must be at least 1"
        )));
    }

    match &spec.transport {
        BackendTransport::Stdio { command, .. } => {
            if command.trim().is_empty() {
                return Err(ProxyError::Config(format!(
                    "backend '{name}': stdio transport requires a command"
                )));
            }
        }
        BackendTransport::Sse { url, .. } | BackendTransport::Streamable { url, .. } => {
            let parsed = url::Url::parse(url).map_err(|e| {
                ProxyError::Config(format!("backend '{name}': invalid url '{url}': {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ProxyError::Config(format!(
                    "backend '{name}': url '{url}' must use http or https"
                )));
            }
        }
    }
    Ok(())
}

/// Resolution order: explicit path, `$MCP_PROXY_CONFIG`, then the default
/// file names under `base`.
pub fn locate_config(
    base: &Path,
    explicit: Option<&Path>,
    env_value: Option<&str>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        return Some(PathBuf::from(value));
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| base.join(name))
        .find(|candidate| candidate.is_file())
}
