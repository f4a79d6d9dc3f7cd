//! Tool registry.
//!
//! This module provides the caller-facing name table:
//! - Discovered tool descriptors and qualified names
//! - Registration-ordered bindings with collision tracking

pub mod registry;
pub mod types;

pub use registry::{RegistryEntry, ToolRegistry};
pub use types::{CollisionEvent, QualifiedToolName, ToolDescriptor};
