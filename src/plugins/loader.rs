//! Plugin loader
//!
//! Imports plugin units, drives them through the plugin contract, and keeps
//! the tool registry and change detector in step with what is active.
//! Operations on one plugin name are serialised; different names proceed
//! independently.

use super::contract::{self, Plugin, PluginDescriptor, PluginMetadata, PluginState};
use super::detector::{ChangeDetector, ChangeKind, ChangeRecord};
use super::discovery::{Discovery, PluginUnit};
use super::registry::ToolRegistry;
use crate::config::PluginConfig;
use crate::error::PluginError;
use crate::logging::AuditLogger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Turns a resolved unit into the plugin implementations it registers
pub trait UnitImporter: Send + Sync {
    fn import(&self, unit: &PluginUnit) -> Result<Vec<Box<dyn Plugin>>, PluginError>;
}

/// Outcome of a load, unload or reload
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub plugin: String,
    pub ok: bool,
    pub error: Option<PluginError>,
    /// Tools registered by a load, or removed by an unload
    pub registered_tools: BTreeSet<String>,
}

impl LoadResult {
    fn success(plugin: &str, tools: BTreeSet<String>) -> Self {
        Self {
            plugin: plugin.to_string(),
            ok: true,
            error: None,
            registered_tools: tools,
        }
    }

    fn failure(plugin: &str, error: PluginError) -> Self {
        Self {
            plugin: plugin.to_string(),
            ok: false,
            error: Some(error),
            registered_tools: BTreeSet::new(),
        }
    }

    fn tool_list(&self) -> Vec<String> {
        self.registered_tools.iter().cloned().collect()
    }
}

/// A change and what applying it did
#[derive(Debug, Clone)]
pub struct ChangeOutcome {
    pub change: ChangeRecord,
    pub result: LoadResult,
}

/// Per-plugin summary of a `reload_changed` pass
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    pub outcomes: Vec<ChangeOutcome>,
}

impl ReloadReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.ok)
    }
}

impl fmt::Display for ReloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outcomes.is_empty() {
            return f.write_str("No plugin changes detected");
        }

        let lines: Vec<String> = self
            .outcomes
            .iter()
            .map(|outcome| {
                let name = &outcome.change.name;
                let result = &outcome.result;
                let count = result.registered_tools.len();
                match (outcome.change.kind, &result.error) {
                    (ChangeKind::Removed, None) => {
                        format!("{}: unloaded, source removed ({} tools)", name, count)
                    }
                    (ChangeKind::Modified, None) => format!("{}: reloaded ({} tools)", name, count),
                    (ChangeKind::Added, None) => format!("{}: loaded, new ({} tools)", name, count),
                    (ChangeKind::Removed, Some(e)) => format!("{}: unload failed: {}", name, e),
                    (ChangeKind::Modified, Some(e)) => format!("{}: reload failed: {}", name, e),
                    (ChangeKind::Added, Some(e)) => format!("{}: load failed: {}", name, e),
                }
            })
            .collect();

        f.write_str(&lines.join("\n"))
    }
}

/// Status of one active plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    pub state: PluginState,
    pub tools: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

/// Snapshot of everything the loader has active
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub generated_at: DateTime<Utc>,
    pub plugin_count: usize,
    pub tool_count: usize,
    pub plugins: BTreeMap<String, PluginSummary>,
    /// Plugins whose last load failed, with the error
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failed: BTreeMap<String, String>,
}

/// Bookkeeping for an active plugin
struct ActivePlugin {
    instance: Arc<dyn Plugin>,
    metadata: PluginMetadata,
    tools: BTreeSet<String>,
    loaded_at: DateTime<Utc>,
}

/// One async mutex per plugin name. Entries are dropped once no operation
/// holds or waits on them.
#[derive(Default)]
struct NameLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NameLocks {
    async fn acquire(&self, name: &str) -> NameGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(name.to_string()).or_default().clone()
        };
        NameGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            name: name.to_string(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Held for the duration of one operation on a plugin name
struct NameGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a NameLocks,
    name: String,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map's own reference left: nobody holds or waits on it
        if locks.get(&self.name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.name);
        }
    }
}

/// Loads, unloads and reloads plugins
pub struct PluginLoader {
    config: PluginConfig,
    discovery: Discovery,
    importer: Arc<dyn UnitImporter>,
    registry: Arc<ToolRegistry>,
    detector: ChangeDetector,
    plugins: RwLock<HashMap<String, ActivePlugin>>,
    failures: RwLock<HashMap<String, String>>,
    transitions: RwLock<HashMap<String, PluginState>>,
    locks: NameLocks,
    audit: Option<Mutex<AuditLogger>>,
}

impl PluginLoader {
    /// Create a loader over the configured plugin directory
    pub fn new(config: PluginConfig, importer: Arc<dyn UnitImporter>, registry: Arc<ToolRegistry>) -> Self {
        let discovery = Discovery::new(config.directory.clone(), config.exclude.clone());
        Self {
            config,
            discovery,
            importer,
            registry,
            detector: ChangeDetector::new(),
            plugins: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            transitions: RwLock::new(HashMap::new()),
            locks: NameLocks::default(),
            audit: None,
        }
    }

    /// Record lifecycle events in an audit log
    pub fn with_audit(mut self, logger: AuditLogger) -> Self {
        self.audit = Some(Mutex::new(logger));
        self
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// List plugin units on disk
    pub fn discover(&self) -> Result<BTreeSet<String>, PluginError> {
        self.discovery.discover()
    }

    /// Load the plugins the configuration asks for at startup
    pub async fn startup(&self) -> Result<Vec<LoadResult>, PluginError> {
        if !self.config.enabled {
            debug!("Plugins disabled in configuration");
            return Ok(vec![]);
        }

        if !self.config.load.is_empty() {
            let mut results = Vec::new();
            for name in &self.config.load {
                results.push(self.load(name).await);
            }
            return Ok(results);
        }

        if self.config.auto_load {
            return self.load_all().await;
        }

        Ok(vec![])
    }

    /// Load every discovered plugin
    pub async fn load_all(&self) -> Result<Vec<LoadResult>, PluginError> {
        let mut results = Vec::new();
        for name in self.discover()? {
            results.push(self.load(&name).await);
        }
        Ok(results)
    }

    /// Unload every active plugin
    pub async fn unload_all(&self) -> Vec<LoadResult> {
        let mut results = Vec::new();
        for name in self.active_names() {
            results.push(self.unload(&name).await);
        }
        results
    }

    /// Load a plugin, replacing it if it is already active
    pub async fn load(&self, name: &str) -> LoadResult {
        let _guard = self.locks.acquire(name).await;
        self.load_locked(name).await
    }

    /// Unload a plugin and withdraw its tools
    pub async fn unload(&self, name: &str) -> LoadResult {
        let _guard = self.locks.acquire(name).await;
        self.unload_locked(name).await
    }

    /// Unload (if active) and load again under one lock.
    ///
    /// Not transactional: when the new load fails a previously active plugin
    /// stays unloaded and is reported as failed.
    pub async fn reload(&self, name: &str) -> LoadResult {
        let _guard = self.locks.acquire(name).await;
        info!("Reloading plugin: {}", name);
        let started = Instant::now();

        let result = self.load_locked(name).await;
        if result.ok {
            self.audit(|log| {
                log.log_reload(name, &result.tool_list(), started.elapsed().as_millis() as u64)
            });
        }
        result
    }

    /// Compare active plugins against disk
    pub fn check_for_changes(&self) -> Result<Vec<ChangeRecord>, PluginError> {
        self.detector
            .check_for_changes(&self.discovery, &self.active_names())
    }

    /// Apply every detected change: unload removed plugins, reload modified
    /// ones, load new ones
    pub async fn reload_changed(&self) -> Result<ReloadReport, PluginError> {
        let changes = self.check_for_changes()?;

        // Failures of units that are gone from disk are no longer interesting
        let discovered = self.discover()?;
        self.write_failures().retain(|name, _| discovered.contains(name));

        let mut report = ReloadReport::default();

        for change in changes {
            let result = match change.kind {
                ChangeKind::Removed => self.unload(&change.name).await,
                ChangeKind::Modified => self.reload(&change.name).await,
                ChangeKind::Added => self.load(&change.name).await,
            };
            report.outcomes.push(ChangeOutcome { change, result });
        }

        Ok(report)
    }

    async fn load_locked(&self, name: &str) -> LoadResult {
        let replacing = self.is_active(name);
        if replacing {
            debug!("Plugin '{}' already active, replacing it", name);
            let unloaded = self.unload_locked(name).await;
            if !unloaded.ok {
                return unloaded;
            }
        }

        let Some(unit) = self.discovery.resolve(name) else {
            let e = PluginError::import(name, "plugin not found");
            warn!("{}", e);
            let mut failures = self.write_failures();
            if replacing || failures.contains_key(name) {
                failures.insert(name.to_string(), e.to_string());
            }
            drop(failures);
            self.audit(|log| log.log_failure(name, "load", &e.to_string()));
            return LoadResult::failure(name, e);
        };

        self.set_transition(name, Some(PluginState::Loading));
        let started = Instant::now();
        let modified = unit.modified();

        let result = match self.try_load(&unit).await {
            Ok(tools) => {
                self.write_failures().remove(name);
                if let Some(modified) = modified {
                    self.detector.record(name, modified);
                }
                info!("Loaded plugin: {} ({} tools)", name, tools.len());
                let result = LoadResult::success(name, tools);
                self.audit(|log| {
                    log.log_load(name, &result.tool_list(), started.elapsed().as_millis() as u64)
                });
                result
            }
            Err(e) => {
                error!("Failed to load plugin {}: {}", name, e);
                // A failed fresh load leaves the plugin unloaded; only losing
                // an active plugin (or failing again) marks it failed
                let mut failures = self.write_failures();
                if replacing || failures.contains_key(name) {
                    failures.insert(name.to_string(), e.to_string());
                }
                drop(failures);
                if let Some(modified) = modified {
                    self.detector.record_rejected(name, modified);
                }
                self.audit(|log| log.log_failure(name, "load", &e.to_string()));
                LoadResult::failure(name, e)
            }
        };

        self.set_transition(name, None);
        result
    }

    async fn try_load(&self, unit: &PluginUnit) -> Result<BTreeSet<String>, PluginError> {
        let name = unit.name.as_str();
        let mut candidates = self.importer.import(unit)?;
        let mut instance = match candidates.len() {
            1 => candidates.remove(0),
            0 => {
                return Err(PluginError::contract(
                    name,
                    "no plugin implementation registered",
                ))
            }
            n => {
                return Err(PluginError::contract(
                    name,
                    format!("{} plugin implementations registered, expected exactly one", n),
                ))
            }
        };

        self.bounded(name, "initialize", instance.initialize()).await?;

        let tools = instance.tools();
        contract::validate(name, instance.metadata(), &tools)?;

        let instance: Arc<dyn Plugin> = Arc::from(instance);
        self.bounded(name, "on_load", instance.on_load()).await?;

        let installed = match self.registry.install_all(name, tools) {
            Ok(installed) => installed,
            Err(e) => {
                self.teardown(name, instance.as_ref()).await;
                return Err(e);
            }
        };

        let mut plugins = self.write_plugins();
        for (previous_owner, tool) in &installed.displaced {
            if let Some(previous) = plugins.get_mut(previous_owner) {
                previous.tools.remove(tool);
            }
        }
        // Another load may have taken a name over since install_all
        // returned; keep only what this plugin still owns
        let owned = self.registry.tools_of(name);
        let tools: BTreeSet<String> = installed.names.intersection(&owned).cloned().collect();
        plugins.insert(
            name.to_string(),
            ActivePlugin {
                metadata: instance.metadata().clone(),
                instance,
                tools: tools.clone(),
                loaded_at: Utc::now(),
            },
        );

        Ok(tools)
    }

    async fn unload_locked(&self, name: &str) -> LoadResult {
        let Some(active) = self.write_plugins().remove(name) else {
            if self.write_failures().remove(name).is_some() {
                info!("Cleared failed plugin: {}", name);
                return LoadResult::success(name, BTreeSet::new());
            }
            warn!("Plugin not loaded: {}", name);
            return LoadResult::failure(name, PluginError::NotLoaded(name.to_string()));
        };

        self.set_transition(name, Some(PluginState::Unloading));

        // Withdraw tools before the hook so nothing dispatches into a
        // plugin that is tearing down
        let removed: BTreeSet<String> = self
            .registry
            .remove_owned(name, &active.tools)
            .into_iter()
            .collect();
        self.teardown(name, active.instance.as_ref()).await;
        drop(active);

        self.detector.forget(name);
        self.write_failures().remove(name);
        self.set_transition(name, None);

        info!("Unloaded plugin: {} ({} tools removed)", name, removed.len());
        let result = LoadResult::success(name, removed);
        self.audit(|log| log.log_unload(name, &result.tool_list()));
        result
    }

    /// Run `on_unload`; failures are logged and never block the unload
    async fn teardown(&self, name: &str, instance: &dyn Plugin) {
        if let Err(e) = self.bounded(name, "on_unload", instance.on_unload()).await {
            warn!("Plugin {} on_unload error: {}", name, e);
            self.audit(|log| log.log_failure(name, "on_unload", &e.to_string()));
        }
    }

    /// Run a plugin hook under the configured time bound
    async fn bounded<F>(&self, name: &str, hook: &str, fut: F) -> Result<(), PluginError>
    where
        F: Future<Output = Result<(), PluginError>>,
    {
        let limit: Duration = self.config.hook_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::hook(
                name,
                hook,
                format!("timed out after {}s", limit.as_secs()),
            )),
        }
    }

    fn audit<F: FnOnce(&mut AuditLogger)>(&self, f: F) {
        if let Some(audit) = &self.audit {
            let mut logger = audit.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut logger);
        }
    }

    fn write_plugins(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ActivePlugin>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_plugins(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ActivePlugin>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_failures(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.failures.write().unwrap_or_else(|e| e.into_inner())
    }

    fn set_transition(&self, name: &str, state: Option<PluginState>) {
        let mut transitions = self.transitions.write().unwrap_or_else(|e| e.into_inner());
        match state {
            Some(state) => transitions.insert(name.to_string(), state),
            None => transitions.remove(name),
        };
    }

    /// Whether a plugin is active
    pub fn is_active(&self, name: &str) -> bool {
        self.read_plugins().contains_key(name)
    }

    /// Names of all active plugins
    pub fn active_names(&self) -> BTreeSet<String> {
        self.read_plugins().keys().cloned().collect()
    }

    /// Current lifecycle state of a plugin
    pub fn state(&self, name: &str) -> PluginState {
        let transitions = self.transitions.read().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = transitions.get(name) {
            return *state;
        }
        drop(transitions);

        if self.is_active(name) {
            PluginState::Active
        } else if self.failure(name).is_some() {
            PluginState::Failed
        } else {
            PluginState::Unloaded
        }
    }

    /// Error from the most recent failed load of a plugin
    pub fn failure(&self, name: &str) -> Option<String> {
        let failures = self.failures.read().unwrap_or_else(|e| e.into_inner());
        failures.get(name).cloned()
    }

    /// Descriptor of an active plugin
    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.read_plugins().get(name).map(|active| PluginDescriptor {
            name: name.to_string(),
            metadata: active.metadata.clone(),
            state: PluginState::Active,
        })
    }

    /// Tools an active plugin has registered
    pub fn tools_of(&self, name: &str) -> BTreeSet<String> {
        self.read_plugins()
            .get(name)
            .map(|active| active.tools.clone())
            .unwrap_or_default()
    }

    /// Snapshot of active plugins and their tools
    pub fn status(&self) -> HostStatus {
        let plugins = self.read_plugins();

        let summaries: BTreeMap<String, PluginSummary> = plugins
            .iter()
            .map(|(name, active)| {
                (
                    name.clone(),
                    PluginSummary {
                        metadata: active.metadata.clone(),
                        state: PluginState::Active,
                        tools: active.tools.iter().cloned().collect(),
                        loaded_at: active.loaded_at,
                    },
                )
            })
            .collect();
        drop(plugins);

        let failures = self.failures.read().unwrap_or_else(|e| e.into_inner());
        let failed: BTreeMap<String, String> =
            failures.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        HostStatus {
            generated_at: Utc::now(),
            plugin_count: summaries.len(),
            tool_count: summaries.values().map(|s| s.tools.len()).sum(),
            plugins: summaries,
            failed,
        }
    }
}
