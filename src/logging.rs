//! Tracing subscriber setup.
//!
//! Logs always go to stderr: stdout carries the MCP stdio protocol.

use tracing_subscriber::{fmt::time::ChronoUtc, EnvFilter};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `RUST_LOG` if set, otherwise `default_directives`.
pub fn build_filter(default_directives: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_directives)?),
    }
}

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false);

    let installed = if config.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.with_target(true).try_init()
    };
    installed.map_err(anyhow::Error::msg)
}
