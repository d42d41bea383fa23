//! Plugin discovery
//!
//! Lists plugin units in the plugin directory and maps names back to the
//! unit on disk. A unit is an executable file, or a directory whose entry
//! point (`main` or `<name>`) is executable. Nothing here imports or runs a
//! plugin.

use crate::error::PluginError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Units that belong to the host itself and are never plugins
pub const INFRASTRUCTURE_UNITS: &[&str] = &[
    "plugin_base",
    "plugin_loader",
    "plugin_manager",
    "plugin_host",
    "dynamic_loader",
];

/// Extensions of manifests, docs and config files that sit next to units
const NON_UNIT_EXTENSIONS: &[&str] = &["json", "toml", "yaml", "yml", "md", "txt"];

/// A plugin unit resolved on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginUnit {
    /// Unit name (filename stem or directory name)
    pub name: String,
    /// Path to the unit's entry point
    pub path: PathBuf,
    /// The unit file itself, or the directory holding a directory unit
    pub root: PathBuf,
}

impl PluginUnit {
    /// A single-file unit
    pub fn file(name: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: name.to_string(),
            root: path.clone(),
            path,
        }
    }

    /// Modification time of the unit's source. For directory units this is
    /// the newest modification time anywhere under the directory.
    pub fn modified(&self) -> Option<SystemTime> {
        if self.root.is_dir() {
            newest_modified(&self.root)
        } else {
            fs::metadata(&self.path).and_then(|m| m.modified()).ok()
        }
    }
}

/// Newest mtime of `dir` and everything below it. Symlinked directories
/// are not followed.
fn newest_modified(dir: &Path) -> Option<SystemTime> {
    let mut newest = fs::metadata(dir).and_then(|m| m.modified()).ok()?;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read {:?}: {}", dir, e);
            return Some(newest);
        }
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let modified = if file_type.is_dir() {
            newest_modified(&entry.path())
        } else {
            entry.metadata().and_then(|m| m.modified()).ok()
        };
        if let Some(modified) = modified {
            newest = newest.max(modified);
        }
    }

    Some(newest)
}

/// Scans a plugin directory
#[derive(Debug, Clone)]
pub struct Discovery {
    directory: PathBuf,
    exclude: Vec<String>,
}

impl Discovery {
    /// Create a discovery over `directory`, skipping the names in `exclude`
    pub fn new(directory: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            directory: directory.into(),
            exclude,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create the plugin directory if it is missing
    pub fn ensure_directory(&self) -> std::io::Result<()> {
        if !self.directory.exists() {
            debug!("Creating plugin directory {:?}", self.directory);
            fs::create_dir_all(&self.directory)?;
        }
        Ok(())
    }

    /// List plugin unit names, sorted
    pub fn discover(&self) -> Result<BTreeSet<String>, PluginError> {
        let entries = fs::read_dir(&self.directory).map_err(|e| {
            PluginError::Discovery(format!("{}: {}", self.directory.display(), e))
        })?;

        Ok(entries
            .flatten()
            .filter_map(|entry| self.unit_at(&entry.path()))
            .map(|unit| unit.name)
            .collect())
    }

    /// Resolve a unit name to its entry point
    pub fn resolve(&self, name: &str) -> Option<PluginUnit> {
        if !self.is_candidate(name) || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }

        let dir_unit = self.directory.join(name);
        if dir_unit.is_dir() {
            return self.unit_at(&dir_unit);
        }

        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read plugin directory: {}", e);
                return None;
            }
        };

        // Sorted so a name backed by two files resolves the same way every time
        let mut matches: Vec<PluginUnit> = entries
            .flatten()
            .filter_map(|e| self.unit_at(&e.path()))
            .filter(|unit| unit.name == name)
            .collect();
        matches.sort_by(|a, b| a.path.cmp(&b.path));

        matches.into_iter().next()
    }

    /// The unit a directory entry holds, if it is one
    fn unit_at(&self, path: &Path) -> Option<PluginUnit> {
        let file_name = path.file_name()?.to_str()?;
        if file_name.starts_with('.') || file_name.starts_with('_') {
            return None;
        }

        if path.is_dir() {
            if !self.is_candidate(file_name) {
                return None;
            }
            let entry = [path.join("main"), path.join(file_name)]
                .into_iter()
                .find(|p| is_executable(p))?;
            return Some(PluginUnit {
                name: file_name.to_string(),
                path: entry,
                root: path.to_path_buf(),
            });
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if NON_UNIT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) || !is_executable(path) {
            return None;
        }

        let name = path.file_stem()?.to_str()?;
        self.is_candidate(name)
            .then(|| PluginUnit::file(name, path))
    }

    fn is_candidate(&self, name: &str) -> bool {
        !name.is_empty()
            && !name.starts_with('_')
            && !name.starts_with('.')
            && !INFRASTRUCTURE_UNITS.contains(&name)
            && !self.exclude.iter().any(|e| e == name)
    }
}

/// Check if a path is an executable file
#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}
