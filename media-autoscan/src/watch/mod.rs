//! The autoscan watcher: a background worker that keeps the content database
//! in sync with the filesystem using kernel inotify events.
//!
//! The worker owns all watcher state (the wd table, the autoscan registry and
//! the inotify fd); external input enters through mutex-guarded command queues
//! and a waker that interrupts the worker's poll.

use std::{
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use anyhow::Context;
use mio::Waker;

use crate::{
    autoscan::{AutoscanDirectory, AutoscanSource},
    config::WatchConfig,
    content::ContentSink,
};

mod inotify;
mod wd;

use inotify::WatchLoop;

/// Commands posted to the worker. Within one drain cycle, monitor requests are
/// processed before unmonitor requests, each in arrival order.
#[derive(Default)]
pub(crate) struct Queues {
    pub monitor: Vec<AutoscanDirectory>,
    pub unmonitor: Vec<PathBuf>,
    pub shutdown: bool,
}

/// Handle to the autoscan worker thread.
pub struct AutoscanWatcher {
    thread_handle: Option<JoinHandle<()>>,
    queues: Arc<Mutex<Queues>>,
    waker: Arc<Waker>,
}

impl AutoscanWatcher {
    /// Reads the configured autoscan list from `source` and starts the worker.
    ///
    /// Fails only if the inotify instance or the poller cannot be created.
    /// Every later error is absorbed by the worker: a directory that cannot be
    /// watched is skipped, not fatal.
    pub fn init(
        sink: impl ContentSink + 'static,
        config: WatchConfig,
        source: &dyn AutoscanSource,
    ) -> anyhow::Result<Self> {
        let initial = source.autoscan_list().context("failed to read the autoscan list")?;
        Self::with_autoscans(sink, config, initial)
    }

    /// Starts the worker with `initial` already queued for monitoring.
    pub fn with_autoscans(
        sink: impl ContentSink + 'static,
        config: WatchConfig,
        initial: Vec<AutoscanDirectory>,
    ) -> anyhow::Result<Self> {
        let queues = Arc::new(Mutex::new(Queues {
            monitor: initial,
            ..Default::default()
        }));
        let (watch_loop, waker) = WatchLoop::new(sink, config, Arc::clone(&queues))?;
        let thread_handle = std::thread::spawn(move || {
            if let Err(e) = watch_loop.run() {
                log::error!("error in autoscan worker: {e:?}");
            }
            log::debug!("autoscan worker has stopped");
        });
        Ok(Self {
            thread_handle: Some(thread_handle),
            queues,
            waker,
        })
    }

    /// Starts monitoring a directory. Returns immediately; the watch is
    /// installed by the worker. Monitoring an already-monitored root is a
    /// no-op (identity is the normalized root path).
    pub fn monitor(&self, dir: AutoscanDirectory) {
        self.queues.lock().unwrap().monitor.push(dir);
        self.wake();
    }

    /// Stops monitoring a directory. Returns immediately.
    pub fn unmonitor(&self, dir: &AutoscanDirectory) {
        self.queues.lock().unwrap().unmonitor.push(dir.location().to_owned());
        self.wake();
    }

    /// Asks the worker to exit at the next loop head. In-flight notifications
    /// are not recalled, and the remaining kernel watches are released by
    /// closing the inotify fd rather than one by one.
    pub fn shutdown(&self) {
        self.queues.lock().unwrap().shutdown = true;
        self.wake();
    }

    /// Shutdown plus join on the worker thread.
    pub fn shutdown_and_join(mut self) -> anyhow::Result<()> {
        self.shutdown();
        if let Some(h) = self.thread_handle.take() {
            h.join()
                .map_err(|e| anyhow::Error::msg(format!("autoscan worker panicked: {e:?}")))?;
        }
        Ok(())
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            log::error!("failed to wake the autoscan worker: {e}");
        }
    }
}

impl Drop for AutoscanWatcher {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.queues.lock().unwrap().shutdown = true;
            let _ = self.waker.wake();
        }
    }
}

/// Normalizes an autoscan root for use as identity: resolves symlinks when the
/// path exists, otherwise cleans it up lexically (`.`, `..`, trailing and
/// duplicate separators).
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
