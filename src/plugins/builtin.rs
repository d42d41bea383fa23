//! Built-in plugins
//!
//! In-process plugin units register themselves here by unit name instead
//! of running as worker processes. Names with no registration fall
//! through to an optional fallback importer.

use super::contract::{Plugin, PluginMetadata, ToolHandler, ToolSpec};
use super::discovery::PluginUnit;
use super::loader::UnitImporter;
use super::protocol::ToolDefinition;
use crate::error::PluginError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a fresh plugin instance for a unit
pub type PluginFactory =
    Arc<dyn Fn(&PluginUnit) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync>;

/// Catalog of in-process plugin factories
#[derive(Default)]
pub struct BuiltinImporter {
    factories: HashMap<String, Vec<PluginFactory>>,
    fallback: Option<Arc<dyn UnitImporter>>,
}

impl BuiltinImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Importer used for units with no registration
    pub fn with_fallback(mut self, fallback: Arc<dyn UnitImporter>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Register a factory for `unit`. Registering twice for one unit makes
    /// that unit ambiguous, which the loader rejects.
    pub fn register<F>(&mut self, unit: &str, factory: F)
    where
        F: Fn(&PluginUnit) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.factories
            .entry(unit.to_string())
            .or_default()
            .push(Arc::new(factory));
    }

    pub fn is_registered(&self, unit: &str) -> bool {
        self.factories.contains_key(unit)
    }
}

impl UnitImporter for BuiltinImporter {
    fn import(&self, unit: &PluginUnit) -> Result<Vec<Box<dyn Plugin>>, PluginError> {
        match self.factories.get(&unit.name) {
            Some(factories) => factories.iter().map(|factory| factory(unit)).collect(),
            None => match &self.fallback {
                Some(fallback) => fallback.import(unit),
                None => Ok(vec![]),
            },
        }
    }
}

/// A plugin whose metadata and tool table are fixed when it is built
pub struct StaticPlugin {
    metadata: PluginMetadata,
    tools: Vec<ToolSpec>,
}

impl StaticPlugin {
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            tools: vec![],
        }
    }

    pub fn with_tool(mut self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.push(ToolSpec::new(definition, handler));
        self
    }
}

#[async_trait]
impl Plugin for StaticPlugin {
    async fn initialize(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn tools(&self) -> Vec<ToolSpec> {
        self.tools.clone()
    }
}
