//! Core types for the tool registry.

use std::{borrow::Cow, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use rmcp::model::JsonObject;
use serde::{Deserialize, Serialize};

use crate::{core::config::Tool, naming::NameForm};

/// Unique tool identifier: `backend:tool_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedToolName {
    pub backend: String,
    pub tool_name: String,
}

impl QualifiedToolName {
    pub fn new(backend: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Parse from "backend:tool" format.
    pub fn parse(s: &str) -> Option<Self> {
        let (backend, tool) = s.split_once(':')?;
        Some(Self::new(backend, tool))
    }
}

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.tool_name)
    }
}

/// A backend tool as discovered. Immutable until the backend is refreshed.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    backend: String,
    tool: Tool,
}

impl ToolDescriptor {
    pub fn new(backend: impl Into<String>, tool: Tool) -> Self {
        Self {
            backend: backend.into(),
            tool,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Backend-local tool name.
    pub fn name(&self) -> &str {
        &self.tool.name
    }

    pub fn description(&self) -> Option<&str> {
        self.tool.description.as_deref()
    }

    pub fn input_schema(&self) -> &Arc<JsonObject> {
        &self.tool.input_schema
    }

    /// The protocol tool exactly as the backend reported it.
    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn qualified_name(&self) -> QualifiedToolName {
        QualifiedToolName::new(&self.backend, self.name())
    }

    /// The protocol tool renamed to a caller-facing name.
    pub fn exposed_as(&self, caller_name: &str) -> Tool {
        let mut tool = self.tool.clone();
        tool.name = Cow::Owned(caller_name.to_string());
        tool
    }
}

/// A caller-facing name that was rebound to a different backend tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollisionEvent {
    pub caller_name: String,
    pub form: NameForm,
    pub previous: QualifiedToolName,
    pub replacement: QualifiedToolName,
    pub at: DateTime<Utc>,
}

impl fmt::Display for CollisionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' rebound from {} to {}",
            self.caller_name, self.previous, self.replacement
        )
    }
}
