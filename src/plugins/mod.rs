//! Plugin system for toolhost
//!
//! Discovers plugin units on disk, loads them through the plugin contract,
//! publishes their tools to the host and reloads them when their source
//! changes.

pub mod builtin;
pub mod contract;
pub mod detector;
pub mod discovery;
pub mod loader;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod registry;

pub use builtin::{BuiltinImporter, StaticPlugin};
pub use contract::{FnHandler, Plugin, PluginDescriptor, PluginMetadata, PluginState, ToolHandler, ToolSpec};
pub use detector::{ChangeDetector, ChangeKind, ChangeRecord};
pub use discovery::{Discovery, PluginUnit};
pub use loader::{HostStatus, LoadResult, PluginLoader, ReloadReport, UnitImporter};
pub use manager::{AdminResponse, PluginManager, ADMIN_OWNER};
pub use process::{ProcessImporter, ProcessPlugin};
pub use protocol::{PluginRequest, PluginResponse, ToolDefinition};
pub use registry::{ToolDescriptor, ToolHost, ToolRegistry, ToolTable};
