//! Autoscan roots: directories the user asked the server to keep in sync with
//! the library.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::SystemTime,
};

use rustc_hash::FxHashMap;
use serde::Deserialize;
use thiserror::Error;

/// Opaque id of an autoscan root, assigned by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AutoscanId(pub u32);

impl fmt::Display for AutoscanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How thoroughly a changed object is re-examined by the content manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanLevel {
    Basic,
    Full,
}

/// A directory declared by the user for automatic synchronization.
#[derive(Debug, Clone)]
pub struct AutoscanDirectory {
    id: AutoscanId,
    location: PathBuf,
    recursive: bool,
    scan_level: ScanLevel,
    persistent: bool,
    last_modified: SystemTime,
}

impl AutoscanDirectory {
    pub fn new(
        id: AutoscanId,
        location: impl Into<PathBuf>,
        recursive: bool,
        scan_level: ScanLevel,
        persistent: bool,
    ) -> Self {
        Self {
            id,
            location: location.into(),
            recursive,
            scan_level,
            persistent,
            last_modified: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn id(&self) -> AutoscanId {
        self.id
    }

    /// The root as declared by the user, before normalization.
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn scan_level(&self) -> ScanLevel {
        self.scan_level
    }

    /// Persistent autoscans come from the configuration and survive restarts.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// Remembers when the last change below this root was seen.
    pub fn set_last_modified(&mut self, when: SystemTime) {
        self.last_modified = when;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AutoscanListError {
    #[error("autoscan {0} is already registered")]
    DuplicateId(AutoscanId),
    #[error("{} is already monitored", .0.display())]
    AlreadyMonitored(PathBuf),
}

/// The set of registered autoscan roots.
///
/// Identity is the root path after normalization, so the same directory cannot
/// be registered twice through different spellings.
#[derive(Default)]
pub struct AutoscanList {
    entries: FxHashMap<AutoscanId, Entry>,
}

struct Entry {
    adir: AutoscanDirectory,
    root: PathBuf,
}

impl AutoscanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a root under its normalized path.
    pub fn insert(&mut self, adir: AutoscanDirectory, root: PathBuf) -> Result<(), AutoscanListError> {
        if self.entries.contains_key(&adir.id()) {
            return Err(AutoscanListError::DuplicateId(adir.id()));
        }
        if self.by_root(&root).is_some() {
            return Err(AutoscanListError::AlreadyMonitored(root));
        }
        self.entries.insert(adir.id(), Entry { adir, root });
        Ok(())
    }

    pub fn remove(&mut self, id: AutoscanId) -> Option<AutoscanDirectory> {
        self.entries.remove(&id).map(|e| e.adir)
    }

    pub fn get(&self, id: AutoscanId) -> Option<&AutoscanDirectory> {
        self.entries.get(&id).map(|e| &e.adir)
    }

    /// The normalized root the autoscan was registered under.
    pub fn root(&self, id: AutoscanId) -> Option<&Path> {
        self.entries.get(&id).map(|e| e.root.as_path())
    }

    pub fn by_root(&self, root: &Path) -> Option<&AutoscanDirectory> {
        self.entries.values().find(|e| e.root == root).map(|e| &e.adir)
    }

    pub fn ids(&self) -> impl Iterator<Item = AutoscanId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AutoscanDirectory> {
        self.entries.values().map(|e| &e.adir)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Storage-side provider of the persistent autoscan list, read once at init.
pub trait AutoscanSource {
    fn autoscan_list(&self) -> anyhow::Result<Vec<AutoscanDirectory>>;
}
