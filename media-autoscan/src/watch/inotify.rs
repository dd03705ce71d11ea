//! The inotify worker: translates kernel events into content operations.
//!
//! # Implementation details
//! The worker combines the inotify fd with `epoll` (wrapped by `mio`'s Poll)
//! so that command posting and shutdown interrupt the wait instead of having
//! to ride on a read timeout. One drain cycle per wakeup: command queues
//! first, then the kernel buffer until `EAGAIN`.

use std::{
    ffi::{OsStr, OsString},
    io::ErrorKind,
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context;
use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor},
};
use walkdir::WalkDir;

use super::{
    normalize_path,
    wd::{AutoscanWatch, MoveWatch, Parent, Watch, WdTable},
    Queues,
};
use crate::{
    autoscan::{AutoscanDirectory, AutoscanId, AutoscanList},
    config::WatchConfig,
    content::ContentSink,
};

const INOTIFY_TOKEN: Token = Token(0);
const COMMAND_TOKEN: Token = Token(1);

/// Expected number of poll events per wakeup.
const EVENTS_CAPACITY: usize = 64;

// AddWatchFlags ops are not const
fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF
        | AddWatchFlags::IN_UNMOUNT
        | AddWatchFlags::IN_IGNORED
}

fn is_hidden(name: &OsStr) -> bool {
    name.as_encoded_bytes().starts_with(b".")
}

/// A MOVED_FROM waiting for its MOVED_TO within the current drain cycle.
/// Whatever stays unpaired degrades to a plain removal; the matching half of a
/// cross-filesystem move never arrives with the same cookie.
struct PendingMove {
    cookie: u32,
    source: PathBuf,
    /// wd of the moved directory at its old path, if it was watched.
    source_wd: Option<WatchDescriptor>,
}

pub(super) struct WatchLoop<S: ContentSink> {
    inotify: Inotify,
    epoll: Poll,
    queues: Arc<Mutex<Queues>>,
    config: WatchConfig,
    table: WdTable,
    autoscans: AutoscanList,
    sink: S,
}

impl<S: ContentSink> WatchLoop<S> {
    pub fn new(sink: S, config: WatchConfig, queues: Arc<Mutex<Queues>>) -> anyhow::Result<(Self, Arc<Waker>)> {
        // initialize inotify in non-blocking mode
        let inotify =
            Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).context("failed to init inotify")?;

        // initialize epoll
        let epoll = Poll::new().context("failed to init epoll")?;

        // create (and register) a waker so commands and shutdown interrupt the poll
        let waker = Arc::new(Waker::new(epoll.registry(), COMMAND_TOKEN).context("failed to create waker")?);

        // register inotify
        let inotify_fd = inotify.as_fd().as_raw_fd();
        let mut source = SourceFd(&inotify_fd);
        epoll
            .registry()
            .register(&mut source, INOTIFY_TOKEN, Interest::READABLE)
            .context("failed to register inotify with epoll")?;

        let s = Self {
            inotify,
            epoll,
            queues,
            config,
            table: WdTable::default(),
            autoscans: AutoscanList::new(),
            sink,
        };
        Ok((s, waker))
    }

    /// Runs the worker until shutdown is requested. Dropping the loop closes
    /// the inotify fd, which releases every remaining kernel watch.
    pub fn run(mut self) -> anyhow::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            let shutdown = self.drain_commands();
            self.drain_inotify()?;
            if shutdown {
                return Ok(());
            }
            if let Err(e) = self.epoll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(anyhow::Error::new(e).context("poll error"));
            }
        }
    }

    /// Processes the queued commands; true if shutdown was requested.
    fn drain_commands(&mut self) -> bool {
        let (monitor, unmonitor, shutdown) = {
            let mut queues = self.queues.lock().unwrap();
            (
                std::mem::take(&mut queues.monitor),
                std::mem::take(&mut queues.unmonitor),
                queues.shutdown,
            )
        };
        for adir in monitor {
            self.monitor_autoscan(adir);
        }
        for location in unmonitor {
            self.unmonitor_autoscan(&location);
        }
        shutdown
    }

    fn drain_inotify(&mut self) -> anyhow::Result<()> {
        loop {
            match self.inotify.read_events() {
                Ok(batch) => self.dispatch_batch(batch),
                Err(Errno::EAGAIN) => return Ok(()),
                Err(err) => {
                    let err = std::io::Error::from(err);
                    return Err(err).context("failed to read events from inotify");
                }
            }
        }
    }

    // ---- registration ----------------------------------------------------

    /// Registers a new autoscan and installs its watches. Monitoring an
    /// already-monitored root is a no-op.
    fn monitor_autoscan(&mut self, adir: AutoscanDirectory) {
        let root = normalize_path(adir.location());
        let id = adir.id();
        log::debug!("monitor request for {root:?} (autoscan {id})");
        if let Err(e) = self.autoscans.insert(adir, root.clone()) {
            log::debug!("ignoring monitor request: {e}");
            return;
        }
        self.install_start_point(id, &root);
        log::debug!("{} directories are now watched", self.table.len());
    }

    /// Installs the start point of a registered autoscan: a real watch when
    /// the root exists, a placeholder on its deepest existing ancestor
    /// otherwise.
    fn install_start_point(&mut self, id: AutoscanId, root: &Path) {
        if root.is_dir() {
            self.monitor_recursive(root, id, true);
        } else {
            self.monitor_nonexisting(id, root);
        }
    }

    /// Removes an autoscan: its start point (real or placeholder) and every
    /// descendant watch it created. Watches serving another autoscan survive.
    fn unmonitor_autoscan(&mut self, location: &Path) {
        let root = normalize_path(location);
        let Some(adir) = self.autoscans.by_root(&root) else {
            log::debug!("unmonitor request for {root:?}, which is not monitored");
            return;
        };
        let id = adir.id();
        log::debug!("unmonitor request for {root:?} (autoscan {id})");
        if let Some(start_wd) = self.table.find_start_point(&root) {
            self.remove_descendants(start_wd, &root);
            self.drop_watch_for_root(start_wd, &root);
        }
        self.autoscans.remove(id);
    }

    // ---- recursive descent -----------------------------------------------

    /// Walks `start` and installs a watch on every directory, honoring the
    /// hidden/symlink filters. Child wds are recorded as descendants of the
    /// autoscan's start point.
    fn monitor_recursive(&mut self, start: &Path, id: AutoscanId, is_start_point: bool) {
        let (recursive, root) = match (self.autoscans.get(id), self.autoscans.root(id)) {
            (Some(adir), Some(root)) => (adir.recursive(), root.to_owned()),
            _ => return,
        };
        let mut start_wd = if is_start_point {
            None
        } else {
            self.table.find_start_point(&root)
        };
        let import_hidden = self.config.import_hidden_files;
        let mut walker = WalkDir::new(start).follow_links(self.config.follow_symlinks);
        if !recursive {
            walker = walker.max_depth(0);
        }
        for entry in walker
            .into_iter()
            .filter_entry(move |e| e.depth() == 0 || import_hidden || !is_hidden(e.file_name()))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    // unreadable entries and symlink loops are skipped, the
                    // rest of the tree is still watched
                    log::debug!("skipping unwatchable entry under {start:?}: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let at_start = entry.depth() == 0;
            let parent = if at_start && is_start_point {
                Parent::Root
            } else {
                self.parent_of(entry.path())
            };
            let Some(wd) = self.monitor_directory(entry.path(), id, &root, at_start && is_start_point, parent)
            else {
                continue;
            };
            if at_start && is_start_point {
                start_wd = Some(wd);
            } else if let Some(swd) = start_wd {
                if swd != wd {
                    self.add_descendant(swd, wd, &root);
                }
            }
        }
    }

    /// Installs (or merges into) the watch for one directory. Returns the wd,
    /// or `None` when the directory cannot be watched; the autoscan keeps
    /// working for the rest of its tree.
    fn monitor_directory(
        &mut self,
        path: &Path,
        id: AutoscanId,
        root: &Path,
        is_start_point: bool,
        parent: Parent,
    ) -> Option<WatchDescriptor> {
        match self.inotify.add_watch(path, watch_mask()) {
            Ok(wd) => {
                let node = self.table.ensure(wd, path, parent);
                if node.watch_for_root(root).is_some() {
                    // two spellings of the same root, or a re-descent over an
                    // already-watched subtree
                    return Some(wd);
                }
                node.watches.push(Watch::Autoscan(AutoscanWatch {
                    autoscan: id,
                    normalized_root: root.to_owned(),
                    is_start_point,
                    descendants: Default::default(),
                    nonexisting_path: None,
                }));
                log::trace!("watching {path:?} (wd {wd:?}, parent {:?}, autoscan {id})", node.parent);
                Some(wd)
            }
            Err(Errno::ENOENT) => {
                if path == root {
                    // the root itself vanished before the watch landed
                    self.monitor_nonexisting(id, root);
                } else {
                    log::debug!("{path:?} vanished before it could be watched");
                }
                None
            }
            Err(Errno::ENOSPC) => {
                log::warn!(
                    "cannot watch {path:?}: inotify watch limit reached, \
                     consider raising /proc/sys/fs/inotify/max_user_watches"
                );
                None
            }
            Err(Errno::EACCES) => {
                log::warn!("cannot watch {path:?}: permission denied");
                None
            }
            Err(err) => {
                log::debug!("inotify_add_watch failed for {path:?}: {err}");
                None
            }
        }
    }

    fn parent_of(&self, path: &Path) -> Parent {
        match path.parent().and_then(|p| self.table.find_by_path(p)) {
            Some((wd, _)) => Parent::Wd(wd),
            None => Parent::Unknown,
        }
    }

    fn add_descendant(&mut self, start_wd: WatchDescriptor, wd: WatchDescriptor, root: &Path) {
        if let Some(watch) = self.table.get_mut(start_wd).and_then(|n| n.watch_for_root_mut(root)) {
            watch.descendants.insert(wd);
        }
    }

    /// For every wd recorded below `start_wd`, removes the watches belonging
    /// to the leaving autoscan.
    fn remove_descendants(&mut self, start_wd: WatchDescriptor, root: &Path) {
        let descendants: Vec<WatchDescriptor> =
            match self.table.get(start_wd).and_then(|n| n.watch_for_root(root)) {
                Some(watch) => watch.descendants.iter().copied().collect(),
                None => return,
            };
        for wd in descendants {
            self.drop_watch_for_root(wd, root);
        }
    }

    /// Removes the watch entries for `root` from one node, releasing the node
    /// when nothing else keeps it alive.
    fn drop_watch_for_root(&mut self, wd: WatchDescriptor, root: &Path) {
        let empty = match self.table.get_mut(wd) {
            Some(node) => {
                node.remove_watches_for_root(root);
                node.watches.is_empty()
            }
            None => return,
        };
        if empty {
            self.release_watch(wd, true);
        }
    }

    /// Erases the node. `rm` removes the kernel watch too; pass false when the
    /// kernel already dropped it (IGNORED, DELETE_SELF, UNMOUNT).
    fn release_watch(&mut self, wd: WatchDescriptor, rm: bool) {
        if let Some(node) = self.table.remove(wd) {
            if rm {
                if let Err(err) = self.inotify.rm_watch(wd) {
                    log::trace!("inotify_rm_watch({:?}) failed: {err}", node.path);
                }
            }
            log::trace!("released watch on {:?}", node.path);
        }
    }

    // ---- nonexisting roots -----------------------------------------------

    /// The autoscan root does not exist: watch its deepest existing ancestor
    /// and remember the unresolved tail, so the watch can be promoted when the
    /// path appears (see `recheck_nonexisting`).
    fn monitor_nonexisting(&mut self, id: AutoscanId, root: &Path) {
        let Some(ancestor) = root.ancestors().find(|a| a.is_dir()) else {
            log::warn!("no existing ancestor for autoscan root {root:?}");
            return;
        };
        let remainder: Vec<OsString> = match root.strip_prefix(ancestor) {
            Ok(tail) => tail.components().map(|c| c.as_os_str().to_owned()).collect(),
            // cannot happen, the ancestor comes from `root`
            Err(_) => return,
        };
        if remainder.is_empty() {
            // lost a race: the root exists after all
            self.monitor_recursive(root, id, true);
            return;
        }
        let ancestor = ancestor.to_owned();
        match self.inotify.add_watch(&ancestor, watch_mask()) {
            Ok(wd) => {
                let node = self.table.ensure(wd, &ancestor, Parent::Root);
                if let Some(watch) = node.watch_for_root_mut(root) {
                    watch.is_start_point = true;
                    watch.nonexisting_path = Some(remainder);
                } else {
                    node.watches.push(Watch::Autoscan(AutoscanWatch {
                        autoscan: id,
                        normalized_root: root.to_owned(),
                        is_start_point: true,
                        descendants: Default::default(),
                        nonexisting_path: Some(remainder),
                    }));
                }
                log::debug!("{root:?} does not exist yet, waiting on {ancestor:?} (wd {wd:?})");
            }
            Err(err) => {
                log::warn!("cannot watch {ancestor:?} while waiting for {root:?}: {err}");
            }
        }
    }

    /// On CREATE/MOVED_TO of a directory: a placeholder waiting on this node
    /// whose next unresolved segment matches the new entry may now descend, or
    /// resolve entirely.
    fn recheck_nonexisting(&mut self, wd: WatchDescriptor, child_name: &OsStr) {
        let Some(node) = self.table.get(wd) else { return };
        let ready: Vec<(AutoscanId, PathBuf)> = node
            .autoscan_watches()
            .filter(|a| {
                a.nonexisting_path
                    .as_ref()
                    .is_some_and(|tail| tail.first().map(OsString::as_os_str) == Some(child_name))
            })
            .map(|a| (a.autoscan, a.normalized_root.clone()))
            .collect();
        for (id, root) in ready {
            log::debug!("{root:?} may have appeared, rechecking");
            self.drop_watch_for_root(wd, &root);
            if root.is_dir() {
                self.monitor_recursive(&root, id, true);
                // content may have landed before the watch; scanning it is the
                // content manager's job
                self.sink.rescan_directory(id);
            } else {
                // only part of the tail resolved, re-anchor deeper
                self.monitor_nonexisting(id, &root);
            }
        }
    }

    // ---- event dispatch --------------------------------------------------

    fn dispatch_batch(&mut self, batch: Vec<InotifyEvent>) {
        if batch.iter().any(|e| e.mask.contains(AddWatchFlags::IN_Q_OVERFLOW)) {
            // the kernel dropped events, the stream cannot be trusted anymore
            log::warn!("inotify queue overflowed, requesting a rescan of every autoscan root");
            let ids: Vec<AutoscanId> = self.autoscans.ids().collect();
            for id in ids {
                self.sink.rescan_directory(id);
            }
            return;
        }
        let mut pending_moves: Vec<PendingMove> = Vec::new();
        for event in batch {
            self.dispatch(event, &mut pending_moves);
        }
        // moves that found no partner in this drain cycle degrade to removals
        for pending in pending_moves {
            log::debug!("unpaired move of {:?}, treating as removal", pending.source);
            self.sink.remove_object(&pending.source);
        }
    }

    fn dispatch(&mut self, event: InotifyEvent, pending_moves: &mut Vec<PendingMove>) {
        let mask = event.mask;
        if mask.contains(AddWatchFlags::IN_IGNORED) {
            // the kernel already dropped this watch
            self.release_watch(event.wd, false);
            return;
        }
        let Some(node) = self.table.get(event.wd) else {
            // pending event for a watch that was just removed
            log::trace!("event {mask:?} for an unknown wd, dropping");
            return;
        };
        let node_path = node.path.clone();
        let full_path = match &event.name {
            Some(name) => node_path.join(name),
            None => node_path,
        };
        let is_dir = mask.contains(AddWatchFlags::IN_ISDIR);
        log::trace!("event {mask:?} for {full_path:?}");

        if mask.intersects(AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_UNMOUNT) {
            self.handle_self_gone(event.wd, true);
            return;
        }
        if mask.contains(AddWatchFlags::IN_MOVE_SELF) {
            self.handle_move_self(event.wd);
            return;
        }

        // placeholders only cover their unresolved tail, not the content of
        // the directory they happen to sit on
        let covered = !self.covering_autoscans(event.wd).is_empty();

        if mask.contains(AddWatchFlags::IN_MOVED_FROM) && covered {
            self.handle_moved_from(&full_path, event.cookie, is_dir, pending_moves);
        }
        if mask.contains(AddWatchFlags::IN_MOVED_TO) {
            self.handle_moved_to(event.wd, &full_path, event.cookie, is_dir, pending_moves);
        }
        if mask.contains(AddWatchFlags::IN_CREATE) {
            self.handle_create(event.wd, &full_path, is_dir);
        }
        if mask.contains(AddWatchFlags::IN_CLOSE_WRITE) && !is_dir {
            self.notify_file_changed(event.wd, &full_path);
        }
        if mask.contains(AddWatchFlags::IN_DELETE) && covered {
            self.sink.remove_object(&full_path);
        }
    }

    /// Autoscans whose watch on this node actually covers its content, with
    /// their recursive flag.
    fn covering_autoscans(&self, wd: WatchDescriptor) -> Vec<(AutoscanId, bool)> {
        let Some(node) = self.table.get(wd) else {
            return Vec::new();
        };
        node.autoscan_watches()
            .filter(|a| a.nonexisting_path.is_none())
            .filter_map(|a| self.autoscans.get(a.autoscan).map(|adir| (a.autoscan, adir.recursive())))
            .collect()
    }

    fn handle_create(&mut self, wd: WatchDescriptor, path: &Path, is_dir: bool) {
        if !is_dir {
            // plain files are imported on IN_CLOSE_WRITE, once their content
            // has settled
            return;
        }
        if let Some(name) = path.file_name() {
            self.recheck_nonexisting(wd, name);
        }
        self.watch_new_directory(wd, path);
    }

    /// A directory appeared in a watched one: extend every covering recursive
    /// autoscan over it and hand it to the content manager.
    fn watch_new_directory(&mut self, wd: WatchDescriptor, path: &Path) {
        if !self.config.import_hidden_files && path.file_name().is_some_and(is_hidden) {
            return;
        }
        for (id, recursive) in self.covering_autoscans(wd) {
            if !recursive {
                continue;
            }
            self.monitor_recursive(path, id, false);
            log::trace!("import new directory {path:?} for autoscan {id}");
            self.sink.add_file(path, true, true, self.config.import_hidden_files);
        }
    }

    /// CLOSE_WRITE: the file was just created or its content may have
    /// changed; (re-)import it once per autoscan covering this directory.
    fn notify_file_changed(&mut self, wd: WatchDescriptor, path: &Path) {
        for (id, _) in self.covering_autoscans(wd) {
            log::trace!("import {path:?} for autoscan {id}");
            self.sink.add_file(path, false, true, self.config.import_hidden_files);
        }
    }

    // ---- moves -------------------------------------------------------------

    fn handle_moved_from(
        &mut self,
        path: &Path,
        cookie: u32,
        is_dir: bool,
        pending_moves: &mut Vec<PendingMove>,
    ) {
        let source_wd = if is_dir {
            self.table.find_by_path(path).map(|(wd, _)| wd)
        } else {
            None
        };
        if let Some(moved_wd) = source_wd {
            self.arm_move_watches(moved_wd, path);
        }
        // the removal is deferred to the end of the drain cycle, a MOVED_TO
        // with the same cookie may still turn it into a move
        pending_moves.push(PendingMove {
            cookie,
            source: path.to_owned(),
            source_wd,
        });
    }

    /// Marks the moved subtree: every node under `path` gets a move watch
    /// carrying the top wd, so a matching MOVED_TO can re-point them all.
    fn arm_move_watches(&mut self, moved_wd: WatchDescriptor, path: &Path) {
        for (_, node) in self.table.iter_mut() {
            if node.path.starts_with(path) {
                node.watches.push(Watch::Move(MoveWatch { remove_wd: moved_wd }));
            }
        }
    }

    fn handle_moved_to(
        &mut self,
        wd: WatchDescriptor,
        path: &Path,
        cookie: u32,
        is_dir: bool,
        pending_moves: &mut Vec<PendingMove>,
    ) {
        if is_dir {
            if let Some(name) = path.file_name() {
                self.recheck_nonexisting(wd, name);
            }
        }
        if let Some(pos) = pending_moves.iter().position(|p| p.cookie == cookie) {
            let pending = pending_moves.remove(pos);
            if !self.covering_autoscans(wd).is_empty() {
                log::debug!("move {:?} -> {path:?}", pending.source);
                self.sink.handle_move(&pending.source, path);
            } else {
                // the destination is not covered (e.g. a placeholder
                // ancestor): the object left the library
                log::debug!("move target {path:?} is not covered, removing {:?}", pending.source);
                self.sink.remove_object(&pending.source);
            }
            if let Some(moved_wd) = pending.source_wd {
                self.finish_directory_move(moved_wd, &pending.source, path);
            }
            if is_dir {
                // the destination may be covered by autoscans the source was
                // not; merge their watches in (no imports, the content only
                // moved)
                for (id, recursive) in self.covering_autoscans(wd) {
                    if recursive {
                        self.monitor_recursive(path, id, false);
                    }
                }
            }
            return;
        }
        // never paired: a cross-filesystem move looks like a plain creation
        // on this side
        if is_dir {
            self.watch_new_directory(wd, path);
        } else {
            for (id, _) in self.covering_autoscans(wd) {
                log::trace!("import moved-in file {path:?} for autoscan {id}");
                self.sink.add_file(path, false, true, self.config.import_hidden_files);
            }
        }
    }

    /// Re-points the moved subtree's nodes at their new paths and clears the
    /// move watches armed by the matching MOVED_FROM.
    fn finish_directory_move(&mut self, moved_wd: WatchDescriptor, from: &Path, to: &Path) {
        for (_, node) in self.table.iter_mut() {
            if !node.remove_move_watches(moved_wd) {
                continue;
            }
            if let Ok(tail) = node.path.strip_prefix(from) {
                let new_path = if tail.as_os_str().is_empty() {
                    to.to_owned()
                } else {
                    to.join(tail)
                };
                log::trace!("re-pointing {:?} to {new_path:?}", node.path);
                node.path = new_path;
            }
        }
    }

    /// MOVE_SELF arrives on the moved directory itself. After a rename paired
    /// inside this drain cycle the node is already re-pointed and there is
    /// nothing left to do; otherwise the directory went somewhere we cannot
    /// see and its stale subtree is torn down.
    fn handle_move_self(&mut self, wd: WatchDescriptor) {
        let Some(node) = self.table.get(wd) else { return };
        if !node.has_move_watch() && node.path.is_dir() {
            return;
        }
        let prefix = node.path.clone();
        let stale: Vec<WatchDescriptor> = self
            .table
            .iter()
            .filter(|(swd, snode)| *swd != wd && snode.path.starts_with(&prefix))
            .map(|(swd, _)| swd)
            .collect();
        for swd in stale {
            self.handle_self_gone(swd, false);
        }
        self.handle_self_gone(wd, false);
    }

    /// The watched directory itself is gone (deleted, moved out of sight, or
    /// its filesystem unmounted). `kernel_dropped` is true when the kernel
    /// releases the watch on its own and follows up with IN_IGNORED.
    fn handle_self_gone(&mut self, wd: WatchDescriptor, kernel_dropped: bool) {
        let Some(node) = self.table.get(wd) else { return };
        log::debug!("watched directory {:?} is gone", node.path);
        let gone: Vec<(AutoscanId, PathBuf, bool)> = node
            .autoscan_watches()
            .map(|a| (a.autoscan, a.normalized_root.clone(), a.is_start_point))
            .collect();
        for (_, root, start_point) in &gone {
            if *start_point {
                self.remove_descendants(wd, root);
            }
        }
        self.release_watch(wd, !kernel_dropped);
        for (id, root, start_point) in gone {
            // the autoscan is still registered: arm a placeholder so the
            // watch comes back when the root reappears
            if start_point && self.autoscans.get(id).is_some() {
                self.monitor_nonexisting(id, &root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscan::ScanLevel;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Add(PathBuf, bool),
        Remove(PathBuf),
        Move(PathBuf, PathBuf),
        Rescan(AutoscanId),
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Call> {
            self.calls.lock().unwrap().drain(..).collect()
        }
    }

    impl ContentSink for RecordingSink {
        fn add_file(&mut self, path: &Path, recursive: bool, _asynchronous: bool, _include_hidden: bool) {
            self.calls.lock().unwrap().push(Call::Add(path.to_owned(), recursive));
        }

        fn remove_object(&mut self, path: &Path) {
            self.calls.lock().unwrap().push(Call::Remove(path.to_owned()));
        }

        fn handle_move(&mut self, from: &Path, to: &Path) {
            self.calls.lock().unwrap().push(Call::Move(from.to_owned(), to.to_owned()));
        }

        fn rescan_directory(&mut self, autoscan: AutoscanId) {
            self.calls.lock().unwrap().push(Call::Rescan(autoscan));
        }
    }

    fn new_loop(config: WatchConfig) -> (WatchLoop<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        let queues = Arc::new(Mutex::new(Queues::default()));
        let (watch_loop, _waker) = WatchLoop::new(sink.clone(), config, queues).unwrap();
        (watch_loop, sink)
    }

    fn adir(id: u32, location: &Path, recursive: bool) -> AutoscanDirectory {
        AutoscanDirectory::new(AutoscanId(id), location, recursive, ScanLevel::Full, false)
    }

    /// tempfile may hand out paths with symlinked components; the watcher
    /// works on normalized roots, so the tests do too.
    fn real_tempdir() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().canonicalize().unwrap();
        (tmp, path)
    }

    fn event(wd: WatchDescriptor, mask: AddWatchFlags, cookie: u32, name: Option<&str>) -> InotifyEvent {
        InotifyEvent {
            wd,
            mask,
            cookie,
            name: name.map(OsString::from),
        }
    }

    #[test]
    fn monitor_is_idempotent() {
        let (mut wl, _sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        std::fs::create_dir(root.join("a")).unwrap();
        std::fs::create_dir(root.join("a/b")).unwrap();

        wl.monitor_autoscan(adir(1, &root, true));
        let watched = wl.table.len();
        assert_eq!(watched, 3);

        wl.monitor_autoscan(adir(1, &root, true));
        wl.monitor_autoscan(adir(2, &root, true)); // same root, different id
        assert_eq!(wl.table.len(), watched);
        assert_eq!(wl.autoscans.len(), 1);
    }

    #[test]
    fn descendants_cover_the_subtree() {
        let (mut wl, _sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        std::fs::create_dir(root.join("sub1")).unwrap();
        std::fs::create_dir(root.join("sub1/sub2")).unwrap();

        wl.monitor_autoscan(adir(1, &root, true));

        let start_wd = wl.table.find_start_point(&root).unwrap();
        let watch = wl.table.get(start_wd).unwrap().watch_for_root(&root).unwrap();
        assert!(watch.is_start_point);
        assert_eq!(watch.descendants.len(), 2);
        for wd in &watch.descendants {
            assert!(wl.table.get(*wd).is_some(), "descendant wd not in the table");
        }
        assert!(wl.table.find_by_path(&root.join("sub1")).is_some());
        assert!(wl.table.find_by_path(&root.join("sub1/sub2")).is_some());
    }

    #[test]
    fn non_recursive_monitor_stays_flat() {
        let (mut wl, _sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        std::fs::create_dir(root.join("sub")).unwrap();

        wl.monitor_autoscan(adir(1, &root, false));
        assert_eq!(wl.table.len(), 1);
        assert!(wl.table.find_by_path(&root.join("sub")).is_none());
    }

    #[test]
    fn hidden_directories_are_filtered() {
        let (_tmp, root) = real_tempdir();
        std::fs::create_dir(root.join(".cache")).unwrap();
        std::fs::create_dir(root.join("visible")).unwrap();

        let (mut wl, _sink) = new_loop(WatchConfig::default());
        wl.monitor_autoscan(adir(1, &root, true));
        assert!(wl.table.find_by_path(&root.join(".cache")).is_none());
        assert!(wl.table.find_by_path(&root.join("visible")).is_some());

        let (mut wl, _sink) = new_loop(WatchConfig {
            import_hidden_files: true,
            ..Default::default()
        });
        wl.monitor_autoscan(adir(1, &root, true));
        assert!(wl.table.find_by_path(&root.join(".cache")).is_some());
    }

    #[test]
    fn symlinked_directories_are_skipped_unless_followed() {
        let (_tmp, root) = real_tempdir();
        let (_other, elsewhere) = real_tempdir();
        std::os::unix::fs::symlink(&elsewhere, root.join("link")).unwrap();

        let (mut wl, _sink) = new_loop(WatchConfig::default());
        wl.monitor_autoscan(adir(1, &root, true));
        assert_eq!(wl.table.len(), 1);

        let (mut wl, _sink) = new_loop(WatchConfig {
            follow_symlinks: true,
            ..Default::default()
        });
        wl.monitor_autoscan(adir(1, &root, true));
        assert_eq!(wl.table.len(), 2);
    }

    #[test]
    fn clean_unmonitor_leaves_no_trace() {
        let (mut wl, _sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        std::fs::create_dir(root.join("sub")).unwrap();

        wl.monitor_autoscan(adir(1, &root, true));
        assert_eq!(wl.table.len(), 2);

        wl.unmonitor_autoscan(&root);
        assert_eq!(wl.table.len(), 0);
        assert!(wl.autoscans.is_empty());
    }

    #[test]
    fn overlapping_autoscans_keep_shared_nodes_alive() {
        let (mut wl, _sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let sub = root.join("sub");
        std::fs::create_dir(&sub).unwrap();

        wl.monitor_autoscan(adir(1, &root, true));
        wl.monitor_autoscan(adir(2, &sub, true));

        let (sub_wd, node) = wl.table.find_by_path(&sub).unwrap();
        assert_eq!(node.autoscan_watches().count(), 2);

        wl.unmonitor_autoscan(&root);
        // the shared node survives, now serving only the inner autoscan
        let node = wl.table.get(sub_wd).unwrap();
        assert_eq!(node.autoscan_watches().count(), 1);
        assert!(node.watch_for_root(&sub).is_some());
        assert!(wl.table.find_start_point(&root).is_none());
    }

    #[test]
    fn nonexisting_root_gets_a_placeholder() {
        let (mut wl, _sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let target = root.join("later/sub");

        wl.monitor_autoscan(adir(1, &target, true));

        let wd = wl.table.find_start_point(&target).unwrap();
        let node = wl.table.get(wd).unwrap();
        assert_eq!(node.path, root);
        let watch = node.watch_for_root(&target).unwrap();
        assert!(watch.is_start_point);
        assert_eq!(
            watch.nonexisting_path.as_deref().unwrap(),
            [OsString::from("later"), OsString::from("sub")]
        );
    }

    #[test]
    fn placeholder_promotes_when_the_path_appears() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let target = root.join("later");

        wl.monitor_autoscan(adir(1, &target, true));
        let ancestor_wd = wl.table.find_start_point(&target).unwrap();

        std::fs::create_dir(&target).unwrap();
        wl.dispatch_batch(vec![event(
            ancestor_wd,
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR,
            0,
            Some("later"),
        )]);

        let start_wd = wl.table.find_start_point(&target).unwrap();
        let node = wl.table.get(start_wd).unwrap();
        assert_eq!(node.path, target);
        assert!(node.watch_for_root(&target).unwrap().nonexisting_path.is_none());
        // the placeholder had no other duty, its node is gone
        assert!(wl.table.get(ancestor_wd).is_none());
        // the initial scan is requested, nothing is imported event by event
        assert_eq!(sink.take(), vec![Call::Rescan(AutoscanId(1))]);
    }

    #[test]
    fn placeholder_descends_one_segment_at_a_time() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let target = root.join("later/sub");

        wl.monitor_autoscan(adir(1, &target, true));
        let ancestor_wd = wl.table.find_start_point(&target).unwrap();

        std::fs::create_dir(root.join("later")).unwrap();
        wl.dispatch_batch(vec![event(
            ancestor_wd,
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR,
            0,
            Some("later"),
        )]);

        let wd = wl.table.find_start_point(&target).unwrap();
        let node = wl.table.get(wd).unwrap();
        assert_eq!(node.path, root.join("later"));
        assert_eq!(
            node.watch_for_root(&target).unwrap().nonexisting_path.as_deref().unwrap(),
            [OsString::from("sub")]
        );
        assert_eq!(sink.take(), vec![]);
    }

    #[test]
    fn file_create_is_imported_on_close_write_only() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root, true));
        let wd = wl.table.find_start_point(&root).unwrap();

        wl.dispatch_batch(vec![event(wd, AddWatchFlags::IN_CREATE, 0, Some("a.mp3"))]);
        assert_eq!(sink.take(), vec![]);

        wl.dispatch_batch(vec![event(wd, AddWatchFlags::IN_CLOSE_WRITE, 0, Some("a.mp3"))]);
        assert_eq!(sink.take(), vec![Call::Add(root.join("a.mp3"), false)]);
    }

    #[test]
    fn delete_emits_a_removal() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root, true));
        let wd = wl.table.find_start_point(&root).unwrap();

        wl.dispatch_batch(vec![event(wd, AddWatchFlags::IN_DELETE, 0, Some("a.mp3"))]);
        assert_eq!(sink.take(), vec![Call::Remove(root.join("a.mp3"))]);
    }

    #[test]
    fn placeholder_ancestor_content_is_not_covered() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let target = root.join("later");

        wl.monitor_autoscan(adir(1, &target, true));
        let ancestor_wd = wl.table.find_start_point(&target).unwrap();

        wl.dispatch_batch(vec![
            event(ancestor_wd, AddWatchFlags::IN_CLOSE_WRITE, 0, Some("x.mp3")),
            event(ancestor_wd, AddWatchFlags::IN_DELETE, 0, Some("x.mp3")),
        ]);
        assert_eq!(sink.take(), vec![]);
    }

    #[test]
    fn paired_move_emits_a_single_handle_move() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root, true));
        let wd = wl.table.find_start_point(&root).unwrap();

        wl.dispatch_batch(vec![
            event(wd, AddWatchFlags::IN_MOVED_FROM, 7, Some("a.mp3")),
            event(wd, AddWatchFlags::IN_MOVED_TO, 7, Some("b.mp3")),
        ]);
        assert_eq!(sink.take(), vec![Call::Move(root.join("a.mp3"), root.join("b.mp3"))]);
    }

    #[test]
    fn paired_move_into_an_uncovered_directory_is_a_removal() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let (_tmp2, other) = real_tempdir();
        let target = other.join("later");
        wl.monitor_autoscan(adir(1, &root, true));
        wl.monitor_autoscan(adir(2, &target, true));
        let root_wd = wl.table.find_start_point(&root).unwrap();
        // the placeholder for `target` sits on `other`, which no autoscan covers
        let placeholder_wd = wl.table.find_start_point(&target).unwrap();

        wl.dispatch_batch(vec![
            event(root_wd, AddWatchFlags::IN_MOVED_FROM, 11, Some("a.mp3")),
            event(placeholder_wd, AddWatchFlags::IN_MOVED_TO, 11, Some("a.mp3")),
        ]);
        assert_eq!(sink.take(), vec![Call::Remove(root.join("a.mp3"))]);
    }

    #[test]
    fn unpaired_moved_from_degrades_to_removal() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root, true));
        let wd = wl.table.find_start_point(&root).unwrap();

        wl.dispatch_batch(vec![event(wd, AddWatchFlags::IN_MOVED_FROM, 9, Some("a.mp3"))]);
        assert_eq!(sink.take(), vec![Call::Remove(root.join("a.mp3"))]);
    }

    #[test]
    fn unpaired_moved_to_degrades_to_import() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root, true));
        let wd = wl.table.find_start_point(&root).unwrap();

        wl.dispatch_batch(vec![event(wd, AddWatchFlags::IN_MOVED_TO, 5, Some("c.mp3"))]);
        assert_eq!(sink.take(), vec![Call::Add(root.join("c.mp3"), false)]);
    }

    #[test]
    fn directory_move_repoints_the_subtree() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        std::fs::create_dir(root.join("a")).unwrap();
        std::fs::create_dir(root.join("a/b")).unwrap();
        wl.monitor_autoscan(adir(1, &root, true));
        let root_wd = wl.table.find_start_point(&root).unwrap();
        let (moved_wd, _) = wl.table.find_by_path(&root.join("a")).unwrap();
        let (inner_wd, _) = wl.table.find_by_path(&root.join("a/b")).unwrap();

        std::fs::rename(root.join("a"), root.join("c")).unwrap();
        wl.dispatch_batch(vec![
            event(root_wd, AddWatchFlags::IN_MOVED_FROM | AddWatchFlags::IN_ISDIR, 3, Some("a")),
            event(root_wd, AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_ISDIR, 3, Some("c")),
            event(moved_wd, AddWatchFlags::IN_MOVE_SELF, 0, None),
        ]);

        assert_eq!(sink.take(), vec![Call::Move(root.join("a"), root.join("c"))]);
        assert_eq!(wl.table.get(moved_wd).unwrap().path, root.join("c"));
        assert_eq!(wl.table.get(inner_wd).unwrap().path, root.join("c/b"));
        assert!(!wl.table.get(moved_wd).unwrap().has_move_watch());
    }

    #[test]
    fn directory_moved_out_of_sight_is_torn_down() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let (_elsewhere_tmp, elsewhere) = real_tempdir();
        std::fs::create_dir(root.join("a")).unwrap();
        std::fs::create_dir(root.join("a/b")).unwrap();
        wl.monitor_autoscan(adir(1, &root, true));
        let root_wd = wl.table.find_start_point(&root).unwrap();
        let (moved_wd, _) = wl.table.find_by_path(&root.join("a")).unwrap();

        std::fs::rename(root.join("a"), elsewhere.join("a")).unwrap();
        wl.dispatch_batch(vec![
            event(root_wd, AddWatchFlags::IN_MOVED_FROM | AddWatchFlags::IN_ISDIR, 4, Some("a")),
            event(moved_wd, AddWatchFlags::IN_MOVE_SELF, 0, None),
        ]);

        assert_eq!(sink.take(), vec![Call::Remove(root.join("a"))]);
        assert!(wl.table.get(moved_wd).is_none());
        assert!(wl.table.find_by_path(&root.join("a/b")).is_none());
        assert_eq!(wl.table.len(), 1);
    }

    #[test]
    fn overflow_requests_a_full_rescan() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root_a) = real_tempdir();
        let (_tmp2, root_b) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root_a, true));
        wl.monitor_autoscan(adir(2, &root_b, true));
        let wd = wl.table.find_start_point(&root_a).unwrap();

        // buffered events in the same batch are dropped: after a loss nothing
        // in the stream can be trusted
        wl.dispatch_batch(vec![
            event(wd, AddWatchFlags::IN_MOVED_FROM, 1, Some("a.mp3")),
            event(wd, AddWatchFlags::IN_Q_OVERFLOW, 0, None),
        ]);

        let mut calls = sink.take();
        calls.sort_by_key(|c| match c {
            Call::Rescan(id) => id.0,
            _ => u32::MAX,
        });
        assert_eq!(calls, vec![Call::Rescan(AutoscanId(1)), Call::Rescan(AutoscanId(2))]);
    }

    #[test]
    fn deleted_start_point_is_rearmed_as_placeholder() {
        let (mut wl, _sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        let target = root.join("sub");
        std::fs::create_dir(&target).unwrap();
        wl.monitor_autoscan(adir(1, &target, true));
        let start_wd = wl.table.find_start_point(&target).unwrap();

        std::fs::remove_dir(&target).unwrap();
        wl.dispatch_batch(vec![event(start_wd, AddWatchFlags::IN_DELETE_SELF, 0, None)]);

        let wd = wl.table.find_start_point(&target).unwrap();
        let node = wl.table.get(wd).unwrap();
        assert_eq!(node.path, root);
        assert_eq!(
            node.watch_for_root(&target).unwrap().nonexisting_path.as_deref().unwrap(),
            [OsString::from("sub")]
        );
    }

    #[test]
    fn new_directory_extends_a_recursive_autoscan() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root, true));
        let wd = wl.table.find_start_point(&root).unwrap();

        let sub = root.join("sub");
        std::fs::create_dir(&sub).unwrap();
        wl.dispatch_batch(vec![event(
            wd,
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR,
            0,
            Some("sub"),
        )]);

        assert_eq!(sink.take(), vec![Call::Add(sub.clone(), true)]);
        let (sub_wd, _) = wl.table.find_by_path(&sub).unwrap();
        let watch = wl.table.get(wd).unwrap().watch_for_root(&root).unwrap();
        assert!(watch.descendants.contains(&sub_wd));
    }

    #[test]
    fn new_directory_is_ignored_by_a_flat_autoscan() {
        let (mut wl, sink) = new_loop(WatchConfig::default());
        let (_tmp, root) = real_tempdir();
        wl.monitor_autoscan(adir(1, &root, false));
        let wd = wl.table.find_start_point(&root).unwrap();

        std::fs::create_dir(root.join("sub")).unwrap();
        wl.dispatch_batch(vec![event(
            wd,
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR,
            0,
            Some("sub"),
        )]);

        assert_eq!(sink.take(), vec![]);
        assert!(wl.table.find_by_path(&root.join("sub")).is_none());
    }
}
