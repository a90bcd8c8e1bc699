//! Intercepted tool registry
//!
//! Tools registered here run inside the hub process with hub privileges. Their
//! arguments and results never reach the sandbox, which is how credentials
//! such as snapshot-storage keys stay out of sandboxed memory and disk.
//!
//! The registry is built once at startup and shared as `Arc<ToolRegistry>`;
//! once shared it cannot be mutated.

mod snapshot;

pub use snapshot::SaveSnapshotTool;

use crate::hub::SessionHub;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Errors that can occur while building the registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// A tool with this name is already registered
    #[error("intercepted tool already registered: {0}")]
    Duplicate(String),
}

/// Result returned to the agent by an intercepted tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the tool did what was asked
    pub success: bool,
    /// Human-readable result or failure message
    pub result: String,
    /// Optional structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutcome {
    /// Successful outcome
    #[must_use]
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            success: true,
            result: result.into(),
            data: None,
        }
    }

    /// Successful outcome with structured data
    #[must_use]
    pub fn ok_with_data(result: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            result: result.into(),
            data: Some(data),
        }
    }

    /// Expected failure
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: message.into(),
            data: None,
        }
    }
}

/// A tool the hub executes itself instead of forwarding to the sandbox.
///
/// Expected failures come back as `ToolOutcome::failure`; an `Err` marks an
/// unexpected fault, which the hub logs and converts to a failed outcome.
#[async_trait]
pub trait InterceptedTool: Send + Sync {
    /// Tool name as the agent calls it
    fn name(&self) -> &'static str;

    /// Execute with access to the owning hub
    async fn execute(
        &self,
        hub: &mut SessionHub,
        args: serde_json::Value,
    ) -> anyhow::Result<ToolOutcome>;
}

/// Name → handler map for intercepted tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn InterceptedTool>>,
}

impl ToolRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in intercepted tools
    #[must_use]
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        // Built-in names are distinct, so this only fails if one is renamed into a clash
        if let Err(e) = registry.register(Arc::new(SaveSnapshotTool)) {
            error!(error = %e, "Failed to register built-in intercepted tool");
        }
        registry
    }

    /// Register a new intercepted tool
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Duplicate` if the name is taken; entries are never replaced.
    pub fn register(&mut self, tool: Arc<dyn InterceptedTool>) -> Result<(), ToolError> {
        let name = tool.name();
        if self.tools.contains_key(name) {
            return Err(ToolError::Duplicate(name.to_string()));
        }
        info!(tool = name, "Registered intercepted tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Whether `name` is handled by the hub
    #[must_use]
    pub fn is_intercepted(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Handler for `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn InterceptedTool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl InterceptedTool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn execute(
            &self,
            _hub: &mut SessionHub,
            args: serde_json::Value,
        ) -> anyhow::Result<ToolOutcome> {
            Ok(ToolOutcome::ok(args.to_string()))
        }
    }

    #[test]
    fn lookup_is_by_exact_name() -> Result<(), ToolError> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool))?;

        assert!(registry.is_intercepted("echo"));
        assert!(!registry.is_intercepted("Echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        Ok(())
    }

    #[test]
    fn duplicate_registration_is_rejected() -> Result<(), ToolError> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool))?;
        assert_eq!(
            registry.register(Arc::new(EchoTool)),
            Err(ToolError::Duplicate("echo".to_string()))
        );
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn builtin_registry_intercepts_snapshot_saves() {
        let registry = ToolRegistry::with_builtin_tools();
        assert_eq!(registry.names(), vec!["save_snapshot"]);
    }

    #[test]
    fn outcome_omits_absent_data() -> Result<(), serde_json::Error> {
        let json = serde_json::to_value(ToolOutcome::failure("nope"))?;
        assert_eq!(json, serde_json::json!({ "success": false, "result": "nope" }));
        Ok(())
    }
}
