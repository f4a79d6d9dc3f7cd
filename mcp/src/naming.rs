//! Caller-facing tool names.
//!
//! A backend tool is exposed under a hierarchical name
//! (`<root>.<backend>.<tool>`), a flat name (`<backend>_<tool>`, canonicalized
//! to `[A-Za-z0-9_]`), or both. The translator also proposes alternative
//! spellings so callers can use the short dotted or flat form of a name that
//! was only registered in the other convention.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMESPACE_ROOT: &str = "proxy";

/// Which caller-facing names are registered for each backend tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    #[default]
    Hierarchical,
    Flat,
    Both,
}

impl NamingConvention {
    pub fn includes_hierarchical(self) -> bool {
        matches!(self, NamingConvention::Hierarchical | NamingConvention::Both)
    }

    pub fn includes_flat(self) -> bool {
        matches!(self, NamingConvention::Flat | NamingConvention::Both)
    }
}

impl fmt::Display for NamingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NamingConvention::Hierarchical => "hierarchical",
            NamingConvention::Flat => "flat",
            NamingConvention::Both => "both",
        })
    }
}

impl std::str::FromStr for NamingConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hierarchical" | "dotted" => Ok(NamingConvention::Hierarchical),
            "flat" | "underscored" => Ok(NamingConvention::Flat),
            "both" => Ok(NamingConvention::Both),
            other => Err(format!(
                "unknown naming convention '{other}' (expected hierarchical, flat or both)"
            )),
        }
    }
}

/// Form of a single caller-facing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameForm {
    Hierarchical,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerName {
    pub name: String,
    pub form: NameForm,
}

/// Maps (backend, tool) pairs to caller-facing names.
#[derive(Debug, Clone)]
pub struct ToolNameTranslator {
    convention: NamingConvention,
    namespace_root: String,
}

impl ToolNameTranslator {
    pub fn new(convention: NamingConvention, namespace_root: impl Into<String>) -> Self {
        Self {
            convention,
            namespace_root: namespace_root.into(),
        }
    }

    pub fn convention(&self) -> NamingConvention {
        self.convention
    }

    pub fn namespace_root(&self) -> &str {
        &self.namespace_root
    }

    pub fn hierarchical_name(&self, backend: &str, tool: &str) -> String {
        format!("{}.{}.{}", self.namespace_root, backend, tool)
    }

    pub fn flat_name(backend: &str, tool: &str) -> String {
        canonicalize_identifier(&format!("{backend}_{tool}"))
    }

    /// Caller-facing names for one backend tool, hierarchical first.
    pub fn translate(&self, backend: &str, tool: &str) -> Vec<CallerName> {
        let mut names = Vec::with_capacity(2);
        if self.convention.includes_hierarchical() {
            names.push(CallerName {
                name: self.hierarchical_name(backend, tool),
                form: NameForm::Hierarchical,
            });
        }
        if self.convention.includes_flat() {
            names.push(CallerName {
                name: Self::flat_name(backend, tool),
                form: NameForm::Flat,
            });
        }
        names
    }

    /// Alternative spellings for a name that missed an exact lookup, in the
    /// order they should be tried. Never contains `requested` itself.
    pub fn resolution_candidates(&self, requested: &str) -> Vec<String> {
        let mut candidates = Vec::new();
        let root_prefix = format!("{}.", self.namespace_root);

        if requested.contains('.') {
            let unrooted = match requested.strip_prefix(&root_prefix) {
                Some(rest) => rest,
                None => {
                    candidates.push(format!("{root_prefix}{requested}"));
                    requested
                }
            };
            if let Some((backend, tool)) = unrooted.split_once('.') {
                if !backend.is_empty() && !tool.is_empty() {
                    candidates.push(Self::flat_name(backend, tool));
                }
            }
        } else {
            for (idx, _) in requested.match_indices('_') {
                let (backend, tool) = (&requested[..idx], &requested[idx + 1..]);
                if !backend.is_empty() && !tool.is_empty() {
                    candidates.push(self.hierarchical_name(backend, tool));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| c != requested && seen.insert(c.clone()));
        candidates
    }
}

impl Default for ToolNameTranslator {
    fn default() -> Self {
        Self::new(NamingConvention::default(), DEFAULT_NAMESPACE_ROOT)
    }
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn canonicalize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
