// Prevent compiling outside of Linux: the watcher is built directly on inotify and epoll.
#[cfg(not(target_os = "linux"))]
compile_error!("only Linux is supported");

pub mod autoscan;
pub mod config;
pub mod content;
pub mod watch;

// re-exports
pub use autoscan::{AutoscanDirectory, AutoscanId, AutoscanList, AutoscanSource, ScanLevel};
pub use config::WatchConfig;
pub use content::ContentSink;
pub use watch::AutoscanWatcher;
