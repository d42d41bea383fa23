//! Plugin contract
//!
//! Every plugin unit hands the loader exactly one [`Plugin`] implementation.
//! The loader drives it through `initialize`, `on_load` and `on_unload`, and
//! publishes the tools it declares.

use super::protocol::{PluginRequest, PluginResponse, ToolDefinition};
use crate::error::PluginError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Tool names a plugin may declare
static TOOL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").expect("tool name pattern"));

/// Plugin metadata
///
/// `name`, `version` and `description` are required. The guidance fields are
/// consumed by the assistant's reasoning layer and never interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anti_patterns: Vec<String>,
}

impl PluginMetadata {
    pub fn new(name: &str, version: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }
}

/// Handler behind a published tool, invoked by the host tool runtime
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, request: PluginRequest) -> PluginResponse;
}

/// Adapts a plain closure into a [`ToolHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(&PluginRequest) -> PluginResponse + Send + Sync,
{
    async fn call(&self, request: PluginRequest) -> PluginResponse {
        (self.0)(&request)
    }
}

/// A tool a plugin declares: its definition plus the handler serving it
#[derive(Clone)]
pub struct ToolSpec {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new(definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            definition,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// The capability set every plugin must implement
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Populate metadata and tools. Must succeed before anything else is called.
    async fn initialize(&mut self) -> Result<(), PluginError>;

    /// Plugin metadata, valid after `initialize`
    fn metadata(&self) -> &PluginMetadata;

    /// Tools provided by this plugin, valid after `initialize`
    fn tools(&self) -> Vec<ToolSpec>;

    /// Called once after `initialize`, before any tool is published
    async fn on_load(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once on teardown, after the tools are withdrawn
    async fn on_unload(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Active,
    Failed,
    Unloading,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Active => "active",
            PluginState::Failed => "failed",
            PluginState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

/// A plugin as the loader tracks it. `name` is the unit name, which may
/// differ from the display name in `metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub metadata: PluginMetadata,
    pub state: PluginState,
}

/// Check what `initialize` produced before anything is published
pub(crate) fn validate(unit: &str, metadata: &PluginMetadata, tools: &[ToolSpec]) -> Result<(), PluginError> {
    for (field, value) in [
        ("name", &metadata.name),
        ("version", &metadata.version),
        ("description", &metadata.description),
    ] {
        if value.trim().is_empty() {
            return Err(PluginError::contract(
                unit,
                format!("missing required metadata field '{}'", field),
            ));
        }
    }

    let mut seen = HashSet::new();
    for tool in tools {
        if !TOOL_NAME.is_match(tool.name()) {
            return Err(PluginError::contract(
                unit,
                format!("invalid tool name '{}'", tool.name()),
            ));
        }
        if !seen.insert(tool.name()) {
            return Err(PluginError::contract(
                unit,
                format!("tool '{}' declared more than once", tool.name()),
            ));
        }
    }

    Ok(())
}
