//! Change detection
//!
//! Keeps the source modification time each active plugin was loaded from
//! and compares it against the plugin directory on demand.

use super::discovery::Discovery;
use crate::error::PluginError;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::debug;

/// Kind of drift between disk and the loaded set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Discoverable but not active
    Added,
    /// Active, and the source changed since it was loaded
    Modified,
    /// Active, and the source is gone
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => f.write_str("added"),
            ChangeKind::Modified => f.write_str("modified"),
            ChangeKind::Removed => f.write_str("removed"),
        }
    }
}

/// One detected change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub name: String,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn new(name: &str, kind: ChangeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Per-plugin baseline modification times
#[derive(Debug, Default)]
pub struct ChangeDetector {
    baselines: RwLock<HashMap<String, SystemTime>>,
    /// Source versions of units whose load failed; not offered again until
    /// they change
    rejected: RwLock<HashMap<String, SystemTime>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the baseline for a plugin. Only a successful load calls this.
    pub fn record(&self, name: &str, modified: SystemTime) {
        let mut baselines = self.baselines.write().unwrap_or_else(|e| e.into_inner());
        baselines.insert(name.to_string(), modified);
        drop(baselines);
        self.write_rejected().remove(name);
    }

    /// Remember the source version of a unit that failed to load
    pub fn record_rejected(&self, name: &str, modified: SystemTime) {
        self.write_rejected().insert(name.to_string(), modified);
    }

    /// Drop the baseline of a plugin that is no longer active
    pub fn forget(&self, name: &str) {
        let mut baselines = self.baselines.write().unwrap_or_else(|e| e.into_inner());
        baselines.remove(name);
    }

    fn write_rejected(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SystemTime>> {
        self.rejected.write().unwrap_or_else(|e| e.into_inner())
    }

    fn is_rejected(&self, name: &str, modified: Option<SystemTime>) -> bool {
        let rejected = self.rejected.read().unwrap_or_else(|e| e.into_inner());
        modified.is_some() && rejected.get(name).copied() == modified
    }

    pub fn baseline(&self, name: &str) -> Option<SystemTime> {
        let baselines = self.baselines.read().unwrap_or_else(|e| e.into_inner());
        baselines.get(name).copied()
    }

    /// Compare `active` plugins against disk and report new units.
    ///
    /// Active plugins come first (removed or modified), then units that are
    /// discoverable but not active, each group in name order. A unit whose
    /// load failed is not reported again until its source changes.
    pub fn check_for_changes(
        &self,
        discovery: &Discovery,
        active: &BTreeSet<String>,
    ) -> Result<Vec<ChangeRecord>, PluginError> {
        let mut changes = Vec::new();

        for name in active {
            let current = discovery.resolve(name).and_then(|unit| unit.modified());
            match current {
                None => changes.push(ChangeRecord::new(name, ChangeKind::Removed)),
                Some(modified) if self.baseline(name) != Some(modified) => {
                    changes.push(ChangeRecord::new(name, ChangeKind::Modified))
                }
                Some(_) => {}
            }
        }

        let discovered = discovery.discover()?;
        self.write_rejected().retain(|name, _| discovered.contains(name));

        for name in discovered {
            if active.contains(&name) {
                continue;
            }
            let modified = discovery.resolve(&name).and_then(|unit| unit.modified());
            if !self.is_rejected(&name, modified) {
                changes.push(ChangeRecord::new(&name, ChangeKind::Added));
            }
        }

        if !changes.is_empty() {
            debug!("Detected {} plugin change(s)", changes.len());
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::plugins::discovery::tests::write_executable;

    fn set_mtime(path: &std::path::Path, mtime: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    fn active(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_changes_at_baseline() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("alpha.sh");
        write_executable(&path, "v1");

        let discovery = Discovery::new(temp_dir.path(), vec![]);
        let detector = ChangeDetector::new();
        let unit = discovery.resolve("alpha").unwrap();
        detector.record("alpha", unit.modified().unwrap());

        let changes = detector
            .check_for_changes(&discovery, &active(&["alpha"]))
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_modified_removed_added() {
        let temp_dir = TempDir::new().unwrap();
        let alpha = temp_dir.path().join("alpha.sh");
        let beta = temp_dir.path().join("beta.sh");
        write_executable(&alpha, "v1");
        write_executable(&beta, "v1");

        let discovery = Discovery::new(temp_dir.path(), vec![]);
        let detector = ChangeDetector::new();
        for name in ["alpha", "beta"] {
            let unit = discovery.resolve(name).unwrap();
            detector.record(name, unit.modified().unwrap());
        }

        let later = SystemTime::now() + Duration::from_secs(60);
        set_mtime(&alpha, later);
        fs::remove_file(&beta).unwrap();
        write_executable(&temp_dir.path().join("gamma.sh"), "v1");

        let changes = detector
            .check_for_changes(&discovery, &active(&["alpha", "beta"]))
            .unwrap();

        assert_eq!(
            changes,
            vec![
                ChangeRecord::new("alpha", ChangeKind::Modified),
                ChangeRecord::new("beta", ChangeKind::Removed),
                ChangeRecord::new("gamma", ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn test_rejected_unit_waits_for_an_edit() {
        let temp_dir = TempDir::new().unwrap();
        let broken = temp_dir.path().join("broken.sh");
        write_executable(&broken, "v1");

        let discovery = Discovery::new(temp_dir.path(), vec![]);
        let detector = ChangeDetector::new();
        let unit = discovery.resolve("broken").unwrap();
        detector.record_rejected("broken", unit.modified().unwrap());

        let changes = detector.check_for_changes(&discovery, &BTreeSet::new()).unwrap();
        assert!(changes.is_empty());

        set_mtime(&broken, SystemTime::now() + Duration::from_secs(60));
        let changes = detector.check_for_changes(&discovery, &BTreeSet::new()).unwrap();
        assert_eq!(changes, vec![ChangeRecord::new("broken", ChangeKind::Added)]);
    }

    #[test]
    fn test_forget_baseline() {
        let detector = ChangeDetector::new();
        detector.record("alpha", SystemTime::UNIX_EPOCH);
        assert_eq!(detector.baseline("alpha"), Some(SystemTime::UNIX_EPOCH));

        detector.forget("alpha");
        assert!(detector.baseline("alpha").is_none());
    }

    #[test]
    fn test_discovery_failure_propagates() {
        let discovery = Discovery::new("/nonexistent/plugins", vec![]);
        let detector = ChangeDetector::new();

        assert!(detector
            .check_for_changes(&discovery, &BTreeSet::new())
            .is_err());
    }
}
