//! Tool registry
//!
//! Tracks which plugin owns each live tool name and mirrors every change
//! into the host tool runtime. `install` and `remove` are the only mutating
//! primitives; a plugin's tools go in as one all-or-nothing batch.

use super::contract::{ToolHandler, ToolSpec};
use super::protocol::{PluginRequest, PluginResponse, ToolDefinition};
pub use crate::config::CollisionPolicy;
use crate::error::PluginError;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// The component that actually receives and dispatches tool invocations
pub trait ToolHost: Send + Sync {
    /// Publish a tool, replacing any tool of the same name
    fn install(&self, name: &str, handler: Arc<dyn ToolHandler>, description: &str) -> Result<(), String>;

    /// Withdraw a tool
    fn remove(&self, name: &str) -> Result<(), String>;
}

/// A live tool
#[derive(Clone)]
pub struct ToolDescriptor {
    /// Tool name, unique across the registry
    pub name: String,
    /// Owning plugin
    pub owner: String,
    /// Published one-line description
    pub description: String,
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn from_spec(owner: &str, spec: ToolSpec) -> Self {
        Self {
            name: spec.definition.name.clone(),
            owner: owner.to_string(),
            description: spec.definition.summary(owner),
            definition: spec.definition,
            handler: spec.handler,
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Outcome of a batch install
#[derive(Debug, Default)]
pub struct Installed {
    /// Names now owned by the installing plugin
    pub names: BTreeSet<String>,
    /// (previous owner, tool) pairs taken over under the overwrite policy
    pub displaced: Vec<(String, String)>,
}

/// Authoritative mapping of live tool names to owner and handler
pub struct ToolRegistry {
    host: Arc<dyn ToolHost>,
    policy: CollisionPolicy,
    tools: RwLock<HashMap<String, ToolDescriptor>>,
}

impl ToolRegistry {
    /// Create a registry mirroring into `host`
    pub fn new(host: Arc<dyn ToolHost>, policy: CollisionPolicy) -> Self {
        Self {
            host,
            policy,
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ToolDescriptor>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ToolDescriptor>> {
        self.tools.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a single tool. Returns the previous owner when the tool was
    /// taken over from another plugin.
    pub fn install(&self, tool: ToolDescriptor) -> Result<Option<String>, PluginError> {
        let owner = tool.owner.clone();
        let installed = self.install_batch(&owner, vec![tool])?;
        Ok(installed.displaced.into_iter().next().map(|(prev, _)| prev))
    }

    /// Install every tool a plugin declares, or none of them
    pub fn install_all(&self, owner: &str, specs: Vec<ToolSpec>) -> Result<Installed, PluginError> {
        let batch = specs
            .into_iter()
            .map(|spec| ToolDescriptor::from_spec(owner, spec))
            .collect();
        self.install_batch(owner, batch)
    }

    fn install_batch(&self, owner: &str, batch: Vec<ToolDescriptor>) -> Result<Installed, PluginError> {
        let mut tools = self.write();

        if self.policy == CollisionPolicy::Reject {
            for tool in &batch {
                if let Some(existing) = tools.get(&tool.name) {
                    if existing.owner != owner {
                        return Err(PluginError::RegistryConflict {
                            tool: tool.name.clone(),
                            owner: existing.owner.clone(),
                            requested_by: owner.to_string(),
                        });
                    }
                }
            }
        }

        let mut installed = Installed::default();
        let mut replaced: Vec<ToolDescriptor> = Vec::new();

        for tool in batch {
            let name = tool.name.clone();
            if let Err(reason) = self.host.install(&name, tool.handler.clone(), &tool.description) {
                self.rollback(&mut tools, &installed.names, replaced);
                return Err(PluginError::Host { tool: name, reason });
            }

            if let Some(previous) = tools.insert(name.clone(), tool) {
                if previous.owner != owner {
                    warn!(
                        "Tool '{}' taken over by '{}' from '{}'",
                        name, owner, previous.owner
                    );
                    installed.displaced.push((previous.owner.clone(), name.clone()));
                }
                replaced.push(previous);
            }

            debug!("  Registered tool: {}", name);
            installed.names.insert(name);
        }

        Ok(installed)
    }

    /// Undo a partially applied batch
    fn rollback(
        &self,
        tools: &mut HashMap<String, ToolDescriptor>,
        installed: &BTreeSet<String>,
        replaced: Vec<ToolDescriptor>,
    ) {
        for name in installed {
            tools.remove(name);
            if let Err(e) = self.host.remove(name) {
                warn!("  Failed to withdraw tool {} during rollback: {}", name, e);
            }
        }
        for previous in replaced {
            if let Err(e) = self
                .host
                .install(&previous.name, previous.handler.clone(), &previous.description)
            {
                warn!("  Failed to restore tool {}: {}", previous.name, e);
                continue;
            }
            tools.insert(previous.name.clone(), previous);
        }
    }

    /// Remove a tool regardless of owner
    pub fn remove(&self, name: &str) -> Option<ToolDescriptor> {
        let mut tools = self.write();
        self.remove_entry(&mut tools, name)
    }

    /// Remove the given tools, skipping any no longer owned by `owner`
    pub fn remove_owned(&self, owner: &str, names: &BTreeSet<String>) -> Vec<String> {
        let mut tools = self.write();
        let mut removed = Vec::new();

        for name in names {
            let current_owner = tools.get(name).map(|t| t.owner.clone());
            match current_owner {
                Some(current) if current == owner => {
                    self.remove_entry(&mut tools, name);
                    removed.push(name.clone());
                }
                Some(current) => {
                    debug!("  Skipping tool {}: now owned by {}", name, current);
                }
                None => {}
            }
        }

        removed
    }

    fn remove_entry(
        &self,
        tools: &mut HashMap<String, ToolDescriptor>,
        name: &str,
    ) -> Option<ToolDescriptor> {
        let removed = tools.remove(name)?;
        if let Err(e) = self.host.remove(name) {
            warn!("  Failed to remove tool {}: {}", name, e);
        } else {
            debug!("  Removed tool: {}", name);
        }
        Some(removed)
    }

    /// Look up a live tool
    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.read().get(name).cloned()
    }

    /// Owner of a live tool
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.read().get(name).map(|t| t.owner.clone())
    }

    /// Names currently owned by `owner`
    pub fn tools_of(&self, owner: &str) -> BTreeSet<String> {
        self.read()
            .values()
            .filter(|t| t.owner == owner)
            .map(|t| t.name.clone())
            .collect()
    }

    /// All live tool names
    pub fn names(&self) -> BTreeSet<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Tool published in a [`ToolTable`]
#[derive(Clone)]
struct HostedTool {
    handler: Arc<dyn ToolHandler>,
    description: String,
}

/// In-process host tool runtime
#[derive(Default)]
pub struct ToolTable {
    tools: RwLock<HashMap<String, HostedTool>>,
}

impl ToolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch an invocation to the handler published under `request.tool`
    pub async fn dispatch(&self, request: PluginRequest) -> PluginResponse {
        let handler = {
            let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
            tools.get(&request.tool).map(|t| t.handler.clone())
        };

        match handler {
            Some(handler) => handler.call(request).await,
            None => PluginResponse::error(&request.id, &format!("Tool not found: {}", request.tool)),
        }
    }

    /// Published tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Published description of a tool
    pub fn description(&self, name: &str) -> Option<String> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.get(name).map(|t| t.description.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.contains_key(name)
    }
}

impl ToolHost for ToolTable {
    fn install(&self, name: &str, handler: Arc<dyn ToolHandler>, description: &str) -> Result<(), String> {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.insert(
            name.to_string(),
            HostedTool {
                handler,
                description: description.to_string(),
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), String> {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| format!("Tool not installed: {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::contract::FnHandler;
    use std::collections::HashMap;

    fn spec(name: &str, reply: &'static str) -> ToolSpec {
        ToolSpec::new(
            ToolDefinition::new(name, "Test tool\nwith details"),
            Arc::new(FnHandler(move |req: &PluginRequest| PluginResponse::output(&req.id, reply))),
        )
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Host that refuses one tool name
    struct PickyHost {
        table: ToolTable,
        refuse: &'static str,
    }

    impl ToolHost for PickyHost {
        fn install(&self, name: &str, handler: Arc<dyn ToolHandler>, description: &str) -> Result<(), String> {
            if name == self.refuse {
                return Err("refused".to_string());
            }
            self.table.install(name, handler, description)
        }

        fn remove(&self, name: &str) -> Result<(), String> {
            self.table.remove(name)
        }
    }

    #[tokio::test]
    async fn test_install_mirrors_into_host() {
        let table = Arc::new(ToolTable::new());
        let registry = ToolRegistry::new(table.clone(), CollisionPolicy::Reject);

        let installed = registry
            .install_all("alpha", vec![spec("alpha_ping", "pong")])
            .unwrap();

        assert_eq!(installed.names, names(&["alpha_ping"]));
        assert_eq!(registry.owner_of("alpha_ping").as_deref(), Some("alpha"));
        assert_eq!(table.description("alpha_ping").as_deref(), Some("Test tool"));

        let resp = table.dispatch(PluginRequest::new("alpha_ping", HashMap::new())).await;
        assert_eq!(resp.output.as_deref(), Some("pong"));
    }

    #[test]
    fn test_reject_policy_installs_nothing() {
        let table = Arc::new(ToolTable::new());
        let registry = ToolRegistry::new(table.clone(), CollisionPolicy::Reject);
        registry.install_all("alpha", vec![spec("shared", "a")]).unwrap();

        let err = registry
            .install_all("beta", vec![spec("beta_only", "b"), spec("shared", "b")])
            .unwrap_err();

        assert!(matches!(err, PluginError::RegistryConflict { ref owner, .. } if owner == "alpha"));
        assert!(registry.tools_of("beta").is_empty());
        assert!(!table.contains("beta_only"));
        assert_eq!(registry.owner_of("shared").as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_overwrite_policy_takes_over() {
        let table = Arc::new(ToolTable::new());
        let registry = ToolRegistry::new(table.clone(), CollisionPolicy::Overwrite);
        registry.install_all("alpha", vec![spec("shared", "a")]).unwrap();

        let installed = registry.install_all("beta", vec![spec("shared", "b")]).unwrap();
        assert_eq!(installed.displaced, vec![("alpha".to_string(), "shared".to_string())]);
        assert_eq!(registry.owner_of("shared").as_deref(), Some("beta"));

        // alpha's teardown must not take beta's tool with it
        let removed = registry.remove_owned("alpha", &names(&["shared"]));
        assert!(removed.is_empty());

        let resp = table.dispatch(PluginRequest::new("shared", HashMap::new())).await;
        assert_eq!(resp.output.as_deref(), Some("b"));
    }

    #[test]
    fn test_host_failure_rolls_back_batch() {
        let host = Arc::new(PickyHost {
            table: ToolTable::new(),
            refuse: "bad_tool",
        });
        let registry = ToolRegistry::new(host.clone(), CollisionPolicy::Overwrite);
        registry.install_all("alpha", vec![spec("shared", "a")]).unwrap();

        let err = registry
            .install_all("beta", vec![spec("shared", "b"), spec("bad_tool", "b")])
            .unwrap_err();

        assert!(matches!(err, PluginError::Host { ref tool, .. } if tool == "bad_tool"));
        assert_eq!(registry.owner_of("shared").as_deref(), Some("alpha"));
        assert_eq!(host.table.names(), vec!["shared".to_string()]);
        assert!(registry.tools_of("beta").is_empty());
    }

    #[test]
    fn test_remove_owned_exact_set() {
        let table = Arc::new(ToolTable::new());
        let registry = ToolRegistry::new(table.clone(), CollisionPolicy::Reject);
        registry
            .install_all("alpha", vec![spec("a", "1"), spec("b", "2")])
            .unwrap();
        registry.install_all("beta", vec![spec("c", "3")]).unwrap();

        let removed = registry.remove_owned("alpha", &names(&["a", "b", "c"]));

        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.names(), names(&["c"]));
        assert_eq!(table.names(), vec!["c".to_string()]);
    }

    #[test]
    fn test_single_install_and_remove() {
        let table = Arc::new(ToolTable::new());
        let registry = ToolRegistry::new(table.clone(), CollisionPolicy::Reject);

        let tool = ToolDescriptor::from_spec("alpha", spec("alpha_ping", "pong"));
        assert_eq!(registry.install(tool).unwrap(), None);
        assert_eq!(registry.len(), 1);

        let removed = registry.remove("alpha_ping").unwrap();
        assert_eq!(removed.owner, "alpha");
        assert!(registry.is_empty());
        assert!(registry.remove("alpha_ping").is_none());
        assert!(!table.contains("alpha_ping"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let table = ToolTable::new();
        let resp = table.dispatch(PluginRequest::new("missing", HashMap::new())).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("Tool not found"));
    }
}
