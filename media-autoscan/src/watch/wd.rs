//! Watch-descriptor bookkeeping.
//!
//! One `WatchNode` exists per live kernel watch descriptor. A node stays alive
//! for as long as at least one `Watch` entry gives a reason to keep it: an
//! autoscan covering the directory, or a pending move being tracked. Removing
//! the last reason removes the node (and, usually, the kernel watch).

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use nix::sys::inotify::WatchDescriptor;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::autoscan::AutoscanId;

/// Position of a watched directory relative to the watch tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parent {
    /// Starting point of an autoscan.
    Root,
    /// The containing directory is not watched.
    Unknown,
    /// wd of the containing directory.
    Wd(WatchDescriptor),
}

/// A directory watched on behalf of one autoscan.
pub(crate) struct AutoscanWatch {
    pub autoscan: AutoscanId,
    /// Identity of the autoscan: its root after normalization.
    pub normalized_root: PathBuf,
    /// True iff this node is the root wd of the autoscan.
    pub is_start_point: bool,
    /// Start points only: every wd created by recursing below this one.
    pub descendants: FxHashSet<WatchDescriptor>,
    /// Set when the autoscan root does not exist yet and this watch sits on
    /// its deepest existing ancestor; holds the unresolved tail, never empty.
    pub nonexisting_path: Option<Vec<OsString>>,
}

/// Tracks a directory that was moved away: `remove_wd` is the wd the moved
/// subtree's top directory had at its previous path.
pub(crate) struct MoveWatch {
    pub remove_wd: WatchDescriptor,
}

pub(crate) enum Watch {
    Autoscan(AutoscanWatch),
    Move(MoveWatch),
}

pub(crate) struct WatchNode {
    /// Snapshot of the directory path when the watch was created; inotify does
    /// not track renames of watched directories, so this is best effort.
    pub path: PathBuf,
    pub parent: Parent,
    /// Insertion order is kept; autoscan watches are matched before move
    /// watches.
    pub watches: Vec<Watch>,
}

impl WatchNode {
    pub fn new(path: PathBuf, parent: Parent) -> Self {
        Self {
            path,
            parent,
            watches: Vec::new(),
        }
    }

    pub fn autoscan_watches(&self) -> impl Iterator<Item = &AutoscanWatch> {
        self.watches.iter().filter_map(|w| match w {
            Watch::Autoscan(a) => Some(a),
            Watch::Move(_) => None,
        })
    }

    pub fn autoscan_watches_mut(&mut self) -> impl Iterator<Item = &mut AutoscanWatch> {
        self.watches.iter_mut().filter_map(|w| match w {
            Watch::Autoscan(a) => Some(a),
            Watch::Move(_) => None,
        })
    }

    /// The watch registered for the given autoscan root, if any.
    pub fn watch_for_root(&self, root: &Path) -> Option<&AutoscanWatch> {
        self.autoscan_watches().find(|a| a.normalized_root == root)
    }

    pub fn watch_for_root_mut(&mut self, root: &Path) -> Option<&mut AutoscanWatch> {
        self.autoscan_watches_mut().find(|a| a.normalized_root == root)
    }

    pub fn has_move_watch(&self) -> bool {
        self.watches.iter().any(|w| matches!(w, Watch::Move(_)))
    }

    /// Removes every autoscan watch whose root is `root`; true if something
    /// was removed.
    pub fn remove_watches_for_root(&mut self, root: &Path) -> bool {
        let before = self.watches.len();
        self.watches.retain(|w| match w {
            Watch::Autoscan(a) => a.normalized_root != root,
            Watch::Move(_) => true,
        });
        self.watches.len() != before
    }

    /// Removes every move watch pointing at `remove_wd`; true if something
    /// was removed.
    pub fn remove_move_watches(&mut self, remove_wd: WatchDescriptor) -> bool {
        let before = self.watches.len();
        self.watches.retain(|w| match w {
            Watch::Move(m) => m.remove_wd != remove_wd,
            Watch::Autoscan(_) => true,
        });
        self.watches.len() != before
    }
}

/// wd → node map. Every entry corresponds to a watch the kernel still knows
/// about (or is about to report `IN_IGNORED` for).
#[derive(Default)]
pub(crate) struct WdTable {
    nodes: FxHashMap<WatchDescriptor, WatchNode>,
}

impl WdTable {
    pub fn get(&self, wd: WatchDescriptor) -> Option<&WatchNode> {
        self.nodes.get(&wd)
    }

    pub fn get_mut(&mut self, wd: WatchDescriptor) -> Option<&mut WatchNode> {
        self.nodes.get_mut(&wd)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the node for `wd`, creating it if the kernel handed out a wd we
    /// have not seen yet. An existing node is re-pointed at `path`: the kernel
    /// returns the same wd for a directory that was watched before, even after
    /// a rename moved it.
    pub fn ensure(&mut self, wd: WatchDescriptor, path: &Path, parent: Parent) -> &mut WatchNode {
        let node = self
            .nodes
            .entry(wd)
            .or_insert_with(|| WatchNode::new(path.to_owned(), parent));
        if node.path != path {
            log::trace!("wd {wd:?} re-pointed from {:?} to {path:?}", node.path);
            node.path = path.to_owned();
        }
        node
    }

    /// Erases the node and drops its wd from every start point's descendant
    /// set, so no set ever references a wd that is not in the table.
    pub fn remove(&mut self, wd: WatchDescriptor) -> Option<WatchNode> {
        let node = self.nodes.remove(&wd);
        if node.is_some() {
            for other in self.nodes.values_mut() {
                for watch in other.autoscan_watches_mut() {
                    watch.descendants.remove(&wd);
                }
            }
        }
        node
    }

    /// Linear scan by path. The table stays small (one entry per watched
    /// directory), so a second index is not worth maintaining.
    pub fn find_by_path(&self, path: &Path) -> Option<(WatchDescriptor, &WatchNode)> {
        self.nodes
            .iter()
            .map(|(wd, node)| (*wd, node))
            .find(|(_, node)| node.path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (WatchDescriptor, &WatchNode)> {
        self.nodes.iter().map(|(wd, node)| (*wd, node))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (WatchDescriptor, &mut WatchNode)> {
        self.nodes.iter_mut().map(|(wd, node)| (*wd, node))
    }

    /// The wd of the start point registered for `root` (real or placeholder).
    pub fn find_start_point(&self, root: &Path) -> Option<WatchDescriptor> {
        self.iter().find_map(|(wd, node)| {
            node.autoscan_watches()
                .any(|a| a.is_start_point && a.normalized_root == root)
                .then_some(wd)
        })
    }
}
