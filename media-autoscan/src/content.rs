//! Contract of the content manager, as seen from the watcher.

use std::path::Path;

use crate::autoscan::AutoscanId;

/// Receiver of the content operations derived from filesystem events.
///
/// All calls are fire-and-forget and must not block: the watcher invokes them
/// from its event loop, and a slow implementation stalls event processing.
pub trait ContentSink: Send {
    /// Import a file or directory into the library.
    fn add_file(&mut self, path: &Path, recursive: bool, asynchronous: bool, include_hidden: bool);

    /// Remove the object stored under `path` from the library.
    fn remove_object(&mut self, path: &Path);

    /// A rename observed inside one filesystem: relocate instead of remove + add.
    fn handle_move(&mut self, from: &Path, to: &Path);

    /// Walk the whole autoscan root again; used when events alone cannot be
    /// trusted (queue overflow) or when a start point (re)appears.
    fn rescan_directory(&mut self, autoscan: AutoscanId);
}
