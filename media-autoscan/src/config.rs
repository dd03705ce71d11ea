//! Options that control how watched trees are traversed.

use serde::Deserialize;

/// Watcher options, usually embedded in the server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Import hidden files and descend into hidden directories.
    pub import_hidden_files: bool,
    /// Follow symbolic links to directories during recursive descent.
    pub follow_symlinks: bool,
}
