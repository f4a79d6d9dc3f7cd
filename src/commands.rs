//! Subcommand implementations.

use std::{io::Write, sync::Arc};

use anyhow::{bail, Context};
use mcp_proxy_core::{ProxyConfig, ProxyManager, StartReport};
use rmcp::model::JsonObject;
use serde::Serialize;
use tracing::{info, warn};

use crate::{cli::Command, server::serve_stdio};

/// One row of `list` output.
#[derive(Debug, Serialize)]
pub struct ListedTool {
    pub name: String,
    pub backend: String,
    pub local_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

pub async fn run(command: Command, config: ProxyConfig) -> anyhow::Result<()> {
    if command == Command::Check {
        return check(&config);
    }

    let manager = Arc::new(ProxyManager::new(config)?);
    let report = manager.start().await?;
    log_degraded(&report);

    let outcome = match command {
        Command::Serve => serve_stdio(manager.clone()).await,
        Command::List { json } => list(&manager, json),
        Command::Call { tool, args } => call(&manager, &tool, &args).await,
        Command::Check => Ok(()),
    };

    let stopped = manager.stop().await;
    if !stopped.is_clean() {
        warn!(forced = ?stopped.forced, "Some backends were force-closed");
    }
    outcome
}

fn log_degraded(report: &StartReport) {
    for failure in &report.failures {
        warn!(backend = %failure.backend, reason = %failure.reason, "Backend unavailable");
    }
}

fn check(config: &ProxyConfig) -> anyhow::Result<()> {
    config.validate()?;
    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "configuration ok: {} backend(s), naming {} (root '{}')",
        config.backends.len(),
        config.naming.convention,
        config.naming.namespace_root
    )?;
    for spec in &config.backends {
        writeln!(
            out,
            "  {:<24} {:<10} {}",
            spec.name,
            spec.transport.label(),
            if spec.enabled { "enabled" } else { "disabled" }
        )?;
    }
    Ok(())
}

pub fn listed_tools(manager: &ProxyManager) -> Vec<ListedTool> {
    manager
        .get_all_tools()
        .iter()
        .map(|bound| ListedTool {
            name: bound.name().to_string(),
            backend: bound.backend().to_string(),
            local_name: bound.local_name().to_string(),
            description: bound.descriptor().description().map(str::to_string),
        })
        .collect()
}

fn list(manager: &ProxyManager, json: bool) -> anyhow::Result<()> {
    let tools = listed_tools(manager);
    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &tools)?;
        writeln!(out)?;
        return Ok(());
    }
    for tool in &tools {
        writeln!(
            out,
            "{:<40} {:<16} {}",
            tool.name,
            tool.backend,
            tool.description.as_deref().unwrap_or("")
        )?;
    }
    info!(count = tools.len(), "Listed tools");
    Ok(())
}

/// Parse `--args` into a JSON object. `{}` and empty input mean no arguments.
pub fn parse_arguments(raw: &str) -> anyhow::Result<Option<JsonObject>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<serde_json::Value>(raw).context("--args is not valid JSON")? {
        serde_json::Value::Object(map) if map.is_empty() => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(map)),
        other => bail!("--args must be a JSON object, got {other}"),
    }
}

async fn call(manager: &ProxyManager, tool: &str, raw_args: &str) -> anyhow::Result<()> {
    let arguments = parse_arguments(raw_args)?;
    let result = manager
        .call_tool(tool, arguments)
        .await
        .with_context(|| format!("calling {tool}"))?;

    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &result)?;
    writeln!(out)?;
    if result.is_error == Some(true) {
        bail!("{tool} reported an error");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert!(parse_arguments("").unwrap().is_none());
        assert!(parse_arguments("{}").unwrap().is_none());

        let args = parse_arguments(r#"{"text": "hi", "n": 2}"#).unwrap().unwrap();
        assert_eq!(args["text"], "hi");
        assert_eq!(args["n"], 2);
    }

    #[test]
    fn test_parse_arguments_rejects_non_objects() {
        assert!(parse_arguments("[1, 2]").is_err());
        assert!(parse_arguments("not json").is_err());
    }

    #[tokio::test]
    async fn test_check_does_not_start_backends() {
        let config = ProxyConfig::from_yaml_str(
            r#"
backends:
  - name: echo
    transport: stdio
    command: /nonexistent/echo-server
"#,
        )
        .unwrap();
        assert!(run(Command::Check, config).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_config_lists_nothing() {
        let manager = ProxyManager::new(ProxyConfig::default()).unwrap();
        manager.start().await.unwrap();
        assert!(listed_tools(&manager).is_empty());
        manager.stop().await;
    }
}
