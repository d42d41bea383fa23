//! Plugin manager
//!
//! Operator-facing façade over the loader. Every operation answers with a
//! success flag and a message; the manager keeps no state of its own.

use super::contract::{ToolHandler, ToolSpec};
use super::loader::{HostStatus, LoadResult, PluginLoader};
use super::protocol::{PluginRequest, PluginResponse, ToolDefinition};
use super::registry::Installed;
use crate::error::PluginError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::info;

/// Registry owner of the administrative tools
pub const ADMIN_OWNER: &str = "plugin_manager";

/// Result of an administrative operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminResponse {
    pub success: bool,
    pub message: String,
}

impl AdminResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Whether a listed plugin is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Loaded,
    Failed,
    Available,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Loaded => f.write_str("loaded"),
            Availability::Failed => f.write_str("failed"),
            Availability::Available => f.write_str("available"),
        }
    }
}

/// One line of `list_available`
#[derive(Debug, Clone, Serialize)]
pub struct PluginListing {
    pub name: String,
    pub availability: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Façade the host's administrative surface talks to
pub struct PluginManager {
    loader: Arc<PluginLoader>,
}

impl PluginManager {
    pub fn new(loader: Arc<PluginLoader>) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// Discovered and active plugins, each annotated with its availability
    pub fn listings(&self) -> Result<Vec<PluginListing>, PluginError> {
        let mut names = self.loader.discover()?;
        names.extend(self.loader.active_names());

        Ok(names
            .into_iter()
            .map(|name| {
                if let Some(descriptor) = self.loader.descriptor(&name) {
                    PluginListing {
                        availability: Availability::Loaded,
                        version: Some(descriptor.metadata.version),
                        detail: Some(descriptor.metadata.description),
                        name,
                    }
                } else if let Some(error) = self.loader.failure(&name) {
                    PluginListing {
                        availability: Availability::Failed,
                        version: None,
                        detail: Some(error),
                        name,
                    }
                } else {
                    PluginListing {
                        availability: Availability::Available,
                        version: None,
                        detail: None,
                        name,
                    }
                }
            })
            .collect())
    }

    /// Render `listings` for an operator
    pub fn list_available(&self) -> AdminResponse {
        let listings = match self.listings() {
            Ok(listings) => listings,
            Err(e) => return AdminResponse::failed(e.to_string()),
        };

        if listings.is_empty() {
            return AdminResponse::ok(format!(
                "No plugins found in {}",
                self.loader.discovery().directory().display()
            ));
        }

        let width = listings.iter().map(|l| l.name.len()).max().unwrap_or(0);
        let mut lines = vec![format!("Plugins ({}):", listings.len())];
        for listing in &listings {
            let mut line = format!(
                "  {:width$}  [{}]",
                listing.name,
                listing.availability,
                width = width
            );
            if let Some(version) = &listing.version {
                line.push_str(&format!(" v{}", version));
            }
            if let Some(detail) = &listing.detail {
                line.push_str(&format!(" - {}", detail));
            }
            lines.push(line);
        }

        AdminResponse::ok(lines.join("\n"))
    }

    /// Structured snapshot of the active plugins
    pub fn status_info(&self) -> HostStatus {
        self.loader.status()
    }

    /// Render `status_info` for an operator
    pub fn status(&self) -> AdminResponse {
        let status = self.status_info();

        let mut lines = vec![
            format!("Plugins loaded: {}", status.plugin_count),
            format!("Tools registered: {}", status.tool_count),
        ];

        for (name, summary) in &status.plugins {
            lines.push(String::new());
            lines.push(format!("{} v{}", name, summary.metadata.version));
            lines.push(format!("  {}", summary.metadata.description));
            if summary.tools.is_empty() {
                lines.push("  Tools: none".to_string());
            } else {
                lines.push(format!("  Tools: {}", summary.tools.join(", ")));
            }
        }

        if !status.failed.is_empty() {
            lines.push(String::new());
            lines.push("Failed:".to_string());
            for (name, error) in &status.failed {
                lines.push(format!("  {}: {}", name, error));
            }
        }

        AdminResponse::ok(lines.join("\n"))
    }

    pub async fn load(&self, name: &str) -> AdminResponse {
        let result = self.loader.load(name).await;
        render("Loaded", "tools", &result)
    }

    pub async fn unload(&self, name: &str) -> AdminResponse {
        let result = self.loader.unload(name).await;
        render("Unloaded", "tools removed", &result)
    }

    pub async fn reload(&self, name: &str) -> AdminResponse {
        let result = self.loader.reload(name).await;
        render("Reloaded", "tools", &result)
    }

    /// Apply every change the detector reports
    pub async fn reload_changed(&self) -> AdminResponse {
        match self.loader.reload_changed().await {
            Ok(report) => AdminResponse {
                success: report.all_ok(),
                message: report.to_string(),
            },
            Err(e) => AdminResponse::failed(e.to_string()),
        }
    }

    /// Publish the administrative operations as tools owned by
    /// [`ADMIN_OWNER`]. The tools hold a weak reference, so they stop
    /// working once the manager is dropped.
    pub fn install_admin_tools(self: &Arc<Self>) -> Result<Installed, PluginError> {
        let weak = Arc::downgrade(self);
        let tool = |op: AdminOp, description: &str, takes_name: bool| {
            let mut definition = ToolDefinition::new(op.tool_name(), description);
            if takes_name {
                definition = definition.with_param("name", "string", "Plugin unit name", true);
            }
            if matches!(op, AdminOp::Unload) {
                definition.is_destructive = true;
                definition.requires_confirmation = true;
            }
            let handler: Arc<dyn ToolHandler> = Arc::new(AdminTool {
                manager: weak.clone(),
                op,
            });
            ToolSpec::new(definition, handler)
        };

        let specs = vec![
            tool(AdminOp::ListAvailable, "List discovered and loaded plugins", false),
            tool(AdminOp::Load, "Load a plugin and register its tools", true),
            tool(AdminOp::Unload, "Unload a plugin and remove its tools", true),
            tool(AdminOp::Reload, "Reload a plugin from disk", true),
            tool(AdminOp::ReloadChanged, "Reload every plugin whose source changed", false),
            tool(AdminOp::Status, "Show loaded plugins and their tools", false),
        ];

        let installed = self.loader.registry().install_all(ADMIN_OWNER, specs)?;
        info!("Installed {} plugin administration tools", installed.names.len());
        Ok(installed)
    }

    /// Withdraw the administrative tools
    pub fn remove_admin_tools(&self) -> Vec<String> {
        let registry = self.loader.registry();
        registry.remove_owned(ADMIN_OWNER, &registry.tools_of(ADMIN_OWNER))
    }
}

fn render(verb: &str, noun: &str, result: &LoadResult) -> AdminResponse {
    if let Some(error) = &result.error {
        return AdminResponse::failed(error.to_string());
    }

    let tools = &result.registered_tools;
    let message = if tools.is_empty() {
        format!("{} plugin '{}' (0 {})", verb, result.plugin, noun)
    } else {
        let names: Vec<&str> = tools.iter().map(String::as_str).collect();
        format!(
            "{} plugin '{}' ({} {}: {})",
            verb,
            result.plugin,
            tools.len(),
            noun,
            names.join(", ")
        )
    };
    AdminResponse::ok(message)
}

#[derive(Debug, Clone, Copy)]
enum AdminOp {
    ListAvailable,
    Load,
    Unload,
    Reload,
    ReloadChanged,
    Status,
}

impl AdminOp {
    fn tool_name(&self) -> &'static str {
        match self {
            AdminOp::ListAvailable => "plugin_list_available",
            AdminOp::Load => "plugin_load",
            AdminOp::Unload => "plugin_unload",
            AdminOp::Reload => "plugin_reload",
            AdminOp::ReloadChanged => "plugin_reload_changed",
            AdminOp::Status => "plugin_status",
        }
    }
}

struct AdminTool {
    manager: Weak<PluginManager>,
    op: AdminOp,
}

#[async_trait]
impl ToolHandler for AdminTool {
    async fn call(&self, request: PluginRequest) -> PluginResponse {
        let Some(manager) = self.manager.upgrade() else {
            return PluginResponse::error(&request.id, "Plugin manager is no longer running");
        };

        let response = match self.op {
            AdminOp::ListAvailable => manager.list_available(),
            AdminOp::Status => manager.status(),
            AdminOp::ReloadChanged => manager.reload_changed().await,
            AdminOp::Load | AdminOp::Unload | AdminOp::Reload => {
                let name = match request.require_string("name") {
                    Ok(name) => name.to_string(),
                    Err(e) => return PluginResponse::error(&request.id, &e),
                };
                match self.op {
                    AdminOp::Load => manager.load(&name).await,
                    AdminOp::Unload => manager.unload(&name).await,
                    _ => manager.reload(&name).await,
                }
            }
        };

        if response.success {
            PluginResponse::output(&request.id, &response.message)
        } else {
            PluginResponse::error(&request.id, &response.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::loader::tests::{fixture, write_unit};
    use crate::plugins::registry::ToolTable;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        table: Arc<ToolTable>,
        manager: Arc<PluginManager>,
    }

    fn harness() -> Harness {
        let fx = fixture();
        Harness {
            dir: fx.dir,
            table: fx.table,
            manager: Arc::new(PluginManager::new(Arc::new(fx.loader))),
        }
    }

    fn call(tool: &str, params: &[(&str, &str)]) -> PluginRequest {
        let params: HashMap<String, serde_json::Value> = params
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        PluginRequest::new(tool, params)
    }

    #[tokio::test]
    async fn test_load_and_status() {
        let h = harness();
        write_unit(h.dir.path(), "alpha", "1.0.0\na\nb", 0);
        write_unit(h.dir.path(), "beta", "2.0.0\nc", 0);
        let manager = &h.manager;

        assert!(manager.load("alpha").await.success);
        assert!(manager.load("beta").await.success);

        let status = manager.status_info();
        assert_eq!(status.plugin_count, 2);
        assert_eq!(status.tool_count, 3);

        let rendered = manager.status();
        assert!(rendered.success);
        assert!(rendered.message.contains("Plugins loaded: 2"));
        assert!(rendered.message.contains("Tools registered: 3"));
        assert!(rendered.message.contains("alpha v1.0.0"));
        assert!(rendered.message.contains("Tools: a, b"));
    }

    #[tokio::test]
    async fn test_list_available_annotates() {
        let h = harness();
        write_unit(h.dir.path(), "alpha", "1.0.0\nalpha_ping", 0);
        write_unit(h.dir.path(), "broken", "1.0.0\nbroken_ping", 0);
        write_unit(h.dir.path(), "gamma", "1.0.0\ngamma_ping", 0);
        write_unit(h.dir.path(), "delta", "1.0.0\n!fail on_load", 0);
        fs::write(h.dir.path().join("_private.plugin"), "1.0.0").unwrap();
        let manager = &h.manager;

        manager.load("alpha").await;
        assert!(manager.load("broken").await.success);
        write_unit(h.dir.path(), "broken", "", 1);
        assert!(!manager.reload("broken").await.success);
        // A plugin that never loaded is still just available
        assert!(!manager.load("delta").await.success);

        let listings = manager.listings().unwrap();
        let by_name: HashMap<_, _> = listings
            .iter()
            .map(|l| (l.name.as_str(), l.availability))
            .collect();
        assert_eq!(by_name.len(), 4);
        assert_eq!(by_name["alpha"], Availability::Loaded);
        assert_eq!(by_name["broken"], Availability::Failed);
        assert_eq!(by_name["gamma"], Availability::Available);
        assert_eq!(by_name["delta"], Availability::Available);

        let rendered = manager.list_available().message;
        assert!(rendered.contains("[loaded] v1.0.0"));
        assert!(!rendered.contains("_private"));
    }

    #[tokio::test]
    async fn test_failures_render_messages() {
        let h = harness();
        let manager = &h.manager;

        let response = manager.unload("ghost").await;
        assert!(!response.success);
        assert_eq!(response.message, "Plugin not loaded: ghost");

        let response = manager.load("ghost").await;
        assert!(!response.success);
        assert!(response.message.contains("plugin not found"));
    }

    #[tokio::test]
    async fn test_reload_changed_messages() {
        let h = harness();
        write_unit(h.dir.path(), "alpha", "1.0.0\nalpha_ping", 0);
        let manager = &h.manager;
        manager.load("alpha").await;

        let response = manager.reload_changed().await;
        assert!(response.success);
        assert_eq!(response.message, "No plugin changes detected");

        write_unit(h.dir.path(), "alpha", "1.1.0\nalpha_ping", 5);
        let response = manager.reload_changed().await;
        assert!(response.success);
        assert!(response.message.contains("alpha: reloaded"));
    }

    #[tokio::test]
    async fn test_admin_tools_dispatch() {
        let h = harness();
        write_unit(h.dir.path(), "alpha", "1.0.0\nalpha_ping", 0);
        let manager = &h.manager;
        let table = &h.table;

        let installed = manager.install_admin_tools().unwrap();
        assert_eq!(installed.names.len(), 6);
        assert!(table.contains("plugin_reload_changed"));

        let resp = table.dispatch(call("plugin_load", &[("name", "alpha")])).await;
        assert!(resp.success, "{:?}", resp.error);
        assert!(table.contains("alpha_ping"));

        let resp = table.dispatch(call("plugin_status", &[])).await;
        assert!(resp.display_text().contains("Plugins loaded: 1"));

        let resp = table.dispatch(call("plugin_unload", &[])).await;
        assert!(!resp.success);

        // Admin tools do not count as plugin tools
        assert_eq!(manager.status_info().tool_count, 1);

        assert_eq!(manager.remove_admin_tools().len(), 6);
        assert!(!table.contains("plugin_status"));
    }

    #[tokio::test]
    async fn test_admin_tools_outlive_manager() {
        let h = harness();
        h.manager.install_admin_tools().unwrap();
        let table = h.table.clone();
        drop(h);

        let resp = table.dispatch(call("plugin_status", &[])).await;
        assert!(!resp.success);
        assert_eq!(
            resp.error.as_deref(),
            Some("Plugin manager is no longer running")
        );
    }
}
