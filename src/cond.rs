//! Conditions: named facts other components can wait on.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default directory where conditions are recorded.
pub const DEFAULT_COND_DIR: &str = "/run/buckos/cond";

/// The condition store as the sequencer sees it.
pub trait Conditions {
    /// Prepare the store. Conditions set before this are not recorded.
    fn init(&mut self) -> Result<()>;

    /// Record `name` as satisfied for the rest of this boot.
    fn set_oneshot(&mut self, name: &str);

    /// Whether `name` has been recorded.
    fn is_set(&self, name: &str) -> bool;

    /// All recorded condition names, sorted.
    fn list(&self) -> Vec<String>;
}

/// Condition store backed by one file per condition under a run directory.
///
/// A condition named `hook/rootfs/up` lives at `<dir>/hook/rootfs/up` and
/// holds the time it was set.
#[derive(Debug)]
pub struct CondStore {
    dir: PathBuf,
    set: BTreeMap<String, DateTime<Utc>>,
    ready: bool,
}

impl CondStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            set: BTreeMap::new(),
            ready: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// When `name` was recorded.
    pub fn set_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.set.get(name).copied()
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        let mut path = self.dir.clone();
        for part in name.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return None;
            }
            path.push(part);
        }
        Some(path)
    }
}

impl Default for CondStore {
    fn default() -> Self {
        Self::new(DEFAULT_COND_DIR)
    }
}

impl Conditions for CondStore {
    fn init(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.ready = true;
        debug!(dir = %self.dir.display(), "Condition store ready");
        Ok(())
    }

    fn set_oneshot(&mut self, name: &str) {
        if !self.ready {
            warn!(condition = name, "Condition store not initialized, dropping condition");
            return;
        }

        let Some(path) = self.path_for(name) else {
            warn!(condition = name, "Invalid condition name");
            return;
        };

        let now = Utc::now();
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::write(&path, format!("{}\n", now.to_rfc3339())));
        if let Err(e) = written {
            warn!(condition = name, error = %e, "Failed to record condition");
            return;
        }

        debug!(condition = name, "Condition set");
        self.set.insert(name.to_string(), now);
    }

    fn is_set(&self, name: &str) -> bool {
        self.set.contains_key(name)
    }

    fn list(&self) -> Vec<String> {
        self.set.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_oneshot_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CondStore::new(dir.path().join("cond"));
        store.init().unwrap();

        store.set_oneshot("hook/rootfs/up");

        assert!(store.is_set("hook/rootfs/up"));
        let content = std::fs::read_to_string(dir.path().join("cond/hook/rootfs/up")).unwrap();
        let stamp = DateTime::parse_from_rfc3339(content.trim()).unwrap();
        assert_eq!(stamp.with_timezone(&Utc), store.set_at("hook/rootfs/up").unwrap());
    }

    #[test]
    fn test_set_before_init_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CondStore::new(dir.path());
        store.set_oneshot("hook/banner");
        assert!(!store.is_set("hook/banner"));
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CondStore::new(dir.path().join("cond"));
        store.init().unwrap();

        store.set_oneshot("../escape");
        store.set_oneshot("hook/banner");

        assert_eq!(store.list(), vec!["hook/banner".to_string()]);
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn test_unwritable_condition_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CondStore::new(dir.path().join("cond"));
        store.init().unwrap();
        std::fs::write(dir.path().join("cond/hook"), "not a directory").unwrap();

        store.set_oneshot("hook/banner");

        assert!(!store.is_set("hook/banner"));
        assert!(store.list().is_empty());
    }
}
