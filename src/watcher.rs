//! Recursive directory watcher
//!
//! This module provides functionality for:
//! 1. Registering one non-recursive watch per directory of the monitored tree
//! 2. Registering directories created (or moved in) while the watcher runs,
//!    including files that landed in them before their watch was live
//! 3. Turning file-creation events into conversion jobs on the dispatch pool
//! 4. Dropping registrations of deleted directories, and stopping once none remain
//!
//! The registration maps are owned by the single thread running the watch
//! loop. `notify` delivers its events onto a channel that loop blocks on.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use lru::LruCache;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::ContextTemplate;
use crate::dispatch::{ConversionJob, DispatchError, DispatchPool, PoolShutdown};
use crate::logger::log_watch_event;

/// Files seeded from freshly registered directories, remembered so their own
/// creation events do not dispatch them a second time
const SEEDED_CAPACITY: usize = 4096;

/// How long after seeding a creation event is still taken as the echo of the
/// seeded file rather than a new file at the same path
const SEED_WINDOW: Duration = Duration::from_secs(2);

/// Error types for the directory watcher
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Not an existing directory: {0}")]
    InvalidPath(PathBuf),

    #[error("Watch service error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for watcher operations
pub type WatchResult<T> = Result<T, WatchError>;

/// Opaque handle of one directory registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey(u64);

#[derive(Debug, Clone)]
pub struct WatchRegistration {
    pub key: WatchKey,
    pub directory: PathBuf,
    pub registered_at: DateTime<Utc>,
}

/// What the watch loop blocks on
#[derive(Debug)]
enum WatchSignal {
    Fs(notify::Result<Event>),
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Break,
}

/// Counters of one watch session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub events_seen: u64,
    pub jobs_dispatched: u64,
    pub jobs_rejected: u64,
    pub overflows: u64,
    pub directories_registered: u64,
    pub directories_remaining: usize,
}

/// Result of a finished watch loop
pub struct WatchOutcome {
    pub summary: WatchSummary,
    /// Directories still registered when the loop ended
    pub directories: Vec<PathBuf>,
    /// The closed worker pool; join it to wait for in-flight jobs
    pub pool: PoolShutdown,
}

/// Stops a running watch loop from another thread.
#[derive(Clone)]
pub struct WatcherHandle {
    signals: Sender<WatchSignal>,
}

impl WatcherHandle {
    /// Ask the loop to exit. Returns `false` when it is already gone.
    pub fn shutdown(&self) -> bool {
        self.signals.send(WatchSignal::Interrupt).is_ok()
    }

    #[cfg(test)]
    fn inject(&self, event: Event) {
        let _ = self.signals.send(WatchSignal::Fs(Ok(event)));
    }
}

pub struct DirectoryWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    signals_tx: Sender<WatchSignal>,
    signals_rx: Receiver<WatchSignal>,
    registrations: HashMap<WatchKey, WatchRegistration>,
    keys_by_path: HashMap<PathBuf, WatchKey>,
    next_key: u64,
    pool: DispatchPool,
    template: Arc<ContextTemplate>,
    seeded: LruCache<PathBuf, Instant>,
    seed_window: Duration,
    summary: WatchSummary,
}

impl DirectoryWatcher {
    /// Register `root` and every directory below it.
    ///
    /// Files already present are not converted; only files created after this
    /// returns are.
    pub fn new(root: impl AsRef<Path>, pool: DispatchPool, template: Arc<ContextTemplate>) -> WatchResult<Self> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(WatchError::MissingArgument("root directory"));
        }
        if !root.is_dir() {
            return Err(WatchError::InvalidPath(root.to_path_buf()));
        }
        let root = root.canonicalize()?;

        let (signals_tx, signals_rx) = flume::unbounded();
        let events = signals_tx.clone();
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _ = events.send(WatchSignal::Fs(result));
        })?;

        let mut watcher = Self {
            root,
            watcher,
            signals_tx,
            signals_rx,
            registrations: HashMap::new(),
            keys_by_path: HashMap::new(),
            next_key: 0,
            pool,
            template,
            seeded: LruCache::new(NonZeroUsize::new(SEEDED_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
            seed_window: SEED_WINDOW,
            summary: WatchSummary::default(),
        };

        let root = watcher.root.clone();
        watcher.register_subtree(&root, false)?;
        if watcher.registrations.is_empty() {
            return Err(WatchError::InvalidPath(root));
        }

        info!(
            root = %watcher.root.display(),
            directories = watcher.registrations.len(),
            "Directory watcher initialized"
        );
        Ok(watcher)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            signals: self.signals_tx.clone(),
        }
    }

    pub fn is_registered(&self, directory: &Path) -> bool {
        self.keys_by_path.contains_key(directory)
    }

    /// Every registered directory, sorted.
    pub fn registered_directories(&self) -> Vec<PathBuf> {
        let mut directories: Vec<PathBuf> = self.keys_by_path.keys().cloned().collect();
        directories.sort();
        directories
    }

    pub fn registration(&self, directory: &Path) -> Option<&WatchRegistration> {
        self.keys_by_path
            .get(directory)
            .and_then(|key| self.registrations.get(key))
    }

    /// Run the watch loop on a dedicated thread.
    pub fn spawn(self) -> WatchResult<(WatcherHandle, JoinHandle<WatchResult<WatchOutcome>>)> {
        let handle = self.handle();
        let thread = thread::Builder::new()
            .name("dir-watcher".to_string())
            .spawn(move || self.run())?;
        Ok((handle, thread))
    }

    /// Block on the event queue until interrupted, until no directory is left
    /// to watch, or until the watch service fails. The pool is closed on
    /// every exit path.
    pub fn run(mut self) -> WatchResult<WatchOutcome> {
        info!(root = %self.root.display(), "Watching for new files");

        let result = loop {
            let Ok(signal) = self.signals_rx.recv() else {
                break Ok(());
            };
            match self.handle_signal(signal) {
                Ok(LoopControl::Continue) => {}
                Ok(LoopControl::Break) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.summary.directories_remaining = self.registrations.len();
        let directories = self.registered_directories();
        let Self { pool, summary, .. } = self;
        let pool = pool.shutdown();

        match result {
            Ok(()) => {
                info!(
                    events = summary.events_seen,
                    dispatched = summary.jobs_dispatched,
                    rejected = summary.jobs_rejected,
                    overflows = summary.overflows,
                    remaining = summary.directories_remaining,
                    "Directory watcher stopped"
                );
                Ok(WatchOutcome {
                    summary,
                    directories,
                    pool,
                })
            }
            Err(e) => {
                warn!(error = %e, "Directory watcher failed");
                Err(e)
            }
        }
    }

    fn handle_signal(&mut self, signal: WatchSignal) -> WatchResult<LoopControl> {
        match signal {
            WatchSignal::Interrupt => {
                debug!("Watch loop interrupted");
                Ok(LoopControl::Break)
            }
            WatchSignal::Fs(Ok(event)) => self.handle_event(event),
            WatchSignal::Fs(Err(e)) if is_fatal(&e) => Err(WatchError::Notify(e)),
            WatchSignal::Fs(Err(e)) => {
                warn!(error = %e, paths = ?e.paths, "Watch error");
                Ok(LoopControl::Continue)
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> WatchResult<LoopControl> {
        self.summary.events_seen += 1;

        if event.need_rescan() || matches!(event.kind, EventKind::Other) {
            self.summary.overflows += 1;
            warn!(kind = ?event.kind, "Watch events were dropped; files created meanwhile are not converted");
            return Ok(LoopControl::Continue);
        }

        let mut touched = Vec::new();
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.on_created(path, &mut touched)?;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to, ..] = event.paths.as_slice() {
                    self.on_removed(from, &mut touched);
                    self.on_created(to, &mut touched)?;
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // Direction unknown: decide by what is on disk now
                for path in &event.paths {
                    if path.exists() {
                        self.on_created(path, &mut touched)?;
                    } else {
                        self.on_removed(path, &mut touched);
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.on_removed(path, &mut touched);
                }
            }
            _ => {}
        }

        self.rearm(touched);
        if self.registrations.is_empty() {
            info!(root = %self.root.display(), "No directories left to watch");
            return Ok(LoopControl::Break);
        }
        Ok(LoopControl::Continue)
    }

    /// The registration an event on `path` belongs to: its parent directory,
    /// or the path itself for events on a watched directory.
    fn resolve(&self, path: &Path) -> Option<WatchKey> {
        path.parent()
            .and_then(|parent| self.keys_by_path.get(parent))
            .or_else(|| self.keys_by_path.get(path))
            .copied()
    }

    fn on_created(&mut self, path: &Path, touched: &mut Vec<WatchKey>) -> WatchResult<()> {
        let Some(key) = self.resolve(path) else {
            debug!(path = %path.display(), "Event outside registered directories");
            return Ok(());
        };
        touched.push(key);

        if path.is_dir() {
            self.register_subtree(path, true)?;
        } else if path.is_file() {
            let echo = self
                .seeded
                .pop(path)
                .is_some_and(|seeded_at| seeded_at.elapsed() < self.seed_window);
            if echo {
                debug!(path = %path.display(), "Already dispatched when its directory was registered");
            } else {
                self.dispatch(path);
            }
        } else {
            debug!(path = %path.display(), "Created entry vanished before it was handled");
        }
        Ok(())
    }

    fn on_removed(&mut self, path: &Path, touched: &mut Vec<WatchKey>) {
        if let Some(key) = self.resolve(path) {
            touched.push(key);
        }
        self.forget_seeded(path);
        if self.keys_by_path.contains_key(path) {
            self.deregister_tree(path);
        }
    }

    /// Check every touched registration and drop those whose directory is gone.
    fn rearm(&mut self, mut touched: Vec<WatchKey>) {
        touched.sort();
        touched.dedup();
        for key in touched {
            let Some(directory) = self.registrations.get(&key).map(|r| r.directory.clone()) else {
                continue;
            };
            if !directory.is_dir() {
                self.deregister_tree(&directory);
            }
        }
    }

    /// Register `path` and every directory below it. With `seed`, regular
    /// files found along the way are dispatched as if just created.
    fn register_subtree(&mut self, path: &Path, seed: bool) -> WatchResult<()> {
        let mut entries = WalkDir::new(path).follow_links(false).into_iter();
        while let Some(entry) = entries.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                if self.keys_by_path.contains_key(entry.path()) {
                    // Covered by an earlier walk, its files were seeded then
                    entries.skip_current_dir();
                    continue;
                }
                self.register(entry.path())?;
            } else if seed && file_type.is_file() {
                let file = entry.into_path();
                self.dispatch(&file);
                self.seeded.put(file, Instant::now());
            }
        }
        Ok(())
    }

    fn register(&mut self, directory: &Path) -> WatchResult<()> {
        if self.keys_by_path.contains_key(directory) {
            return Ok(());
        }

        match self.watcher.watch(directory, RecursiveMode::NonRecursive) {
            Ok(()) => {}
            Err(e) if is_fatal(&e) => return Err(WatchError::Notify(e)),
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "Could not register directory");
                return Ok(());
            }
        }

        let key = WatchKey(self.next_key);
        self.next_key += 1;
        self.keys_by_path.insert(directory.to_path_buf(), key);
        self.registrations.insert(
            key,
            WatchRegistration {
                key,
                directory: directory.to_path_buf(),
                registered_at: Utc::now(),
            },
        );
        self.summary.directories_registered += 1;
        debug!(directory = %directory.display(), key = key.0, "Registered directory");
        Ok(())
    }

    /// Forget seeded files at or below `path`, so a file recreated there is
    /// dispatched again.
    fn forget_seeded(&mut self, path: &Path) {
        let stale: Vec<PathBuf> = self
            .seeded
            .iter()
            .map(|(seeded, _)| seeded)
            .filter(|seeded| seeded.starts_with(path))
            .cloned()
            .collect();
        for seeded in stale {
            self.seeded.pop(&seeded);
        }
    }

    /// Drop the registration of `directory` and of everything below it.
    fn deregister_tree(&mut self, directory: &Path) {
        let doomed: Vec<PathBuf> = self
            .keys_by_path
            .keys()
            .filter(|path| path.starts_with(directory))
            .cloned()
            .collect();

        for path in doomed {
            if let Some(key) = self.keys_by_path.remove(&path) {
                self.registrations.remove(&key);
            }
            // The backend usually dropped the watch together with the directory
            if let Err(e) = self.watcher.unwatch(&path) {
                debug!(directory = %path.display(), error = %e, "Unwatch failed");
            }
            log_watch_event("directory_removed", &path, "registration dropped");
        }
    }

    fn dispatch(&mut self, file: &Path) {
        let job = ConversionJob::new(file, self.template.materialize());
        let job_id = job.id;
        match self.pool.submit(job) {
            Ok(()) => {
                self.summary.jobs_dispatched += 1;
                log_watch_event("file_created", file, &format!("dispatched as job {}", job_id));
            }
            Err(DispatchError::QueueFull(_)) => self.summary.jobs_rejected += 1,
            Err(e) => warn!(path = %file.display(), error = %e, "Could not dispatch conversion"),
        }
    }
}

/// Errors after which the watch service cannot be trusted to deliver events
fn is_fatal(error: &notify::Error) -> bool {
    matches!(
        error.kind,
        notify::ErrorKind::MaxFilesWatch | notify::ErrorKind::InvalidConfig(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmitPolicy;
    use crate::context::ConversionContext;
    use crate::dispatch::PoolSettings;
    use crate::engine::{ConversionLauncher, EngineResult};
    use notify::event::{CreateKind, Flag, RemoveKind};
    use std::fs;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(500);

    /// Forwards the source of every job it runs
    struct Recorder {
        sources: Sender<PathBuf>,
    }

    impl ConversionLauncher for Recorder {
        fn launch(&self, job: &ConversionJob) -> EngineResult<Vec<PathBuf>> {
            let _ = self.sources.send(job.source.clone());
            Ok(Vec::new())
        }
    }

    fn template() -> Arc<ContextTemplate> {
        Arc::new(ContextTemplate::new(ConversionContext {
            destination_format: Some("pdf".to_string()),
            ..ConversionContext::default()
        }))
    }

    fn recording_pool() -> (DispatchPool, Receiver<PathBuf>) {
        let (tx, rx) = flume::unbounded();
        let settings = PoolSettings {
            workers: 2,
            queue_capacity: 64,
            submit_policy: SubmitPolicy::Reject,
            report_capacity: 64,
        };
        let pool = DispatchPool::new(settings, Arc::new(Recorder { sources: tx }), template()).unwrap();
        (pool, rx)
    }

    fn watcher(root: &Path) -> (DirectoryWatcher, Receiver<PathBuf>) {
        let (pool, rx) = recording_pool();
        (DirectoryWatcher::new(root, pool, template()).unwrap(), rx)
    }

    fn expect_once(jobs: &Receiver<PathBuf>, file: &Path) {
        assert_eq!(jobs.recv_timeout(WAIT).unwrap(), file);
        assert!(jobs.recv_timeout(QUIET).is_err(), "file dispatched twice");
    }

    #[test]
    fn test_rejects_missing_and_empty_roots() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, b"x").unwrap();

        let (pool, _) = recording_pool();
        assert!(matches!(
            DirectoryWatcher::new("", pool, template()),
            Err(WatchError::MissingArgument(_))
        ));
        let (pool, _) = recording_pool();
        assert!(matches!(
            DirectoryWatcher::new(dir.path().join("absent"), pool, template()),
            Err(WatchError::InvalidPath(_))
        ));
        let (pool, _) = recording_pool();
        assert!(matches!(
            DirectoryWatcher::new(&file, pool, template()),
            Err(WatchError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_registers_whole_tree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::create_dir_all(dir.path().join("c")).unwrap();

        let (watcher, _) = watcher(dir.path());
        let root = watcher.root().to_path_buf();
        assert_eq!(
            watcher.registered_directories(),
            vec![root.clone(), root.join("a"), root.join("a/b"), root.join("c")]
        );
        assert!(watcher.registration(&root.join("a/b")).is_some());
    }

    #[test]
    fn test_new_file_in_leaf_dispatched_once() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        let (watcher, jobs) = watcher(dir.path());
        let leaf = watcher.root().join("x/y");
        let (handle, thread) = watcher.spawn().unwrap();

        let file = leaf.join("report.csv");
        fs::write(&file, b"a,b\n").unwrap();
        expect_once(&jobs, &file);

        assert!(handle.shutdown());
        let outcome = thread.join().unwrap().unwrap();
        assert_eq!(outcome.summary.jobs_dispatched, 1);
        outcome.pool.join();
    }

    #[test]
    fn test_file_in_new_subdirectory_dispatched_once() {
        let dir = tempdir().unwrap();
        let (watcher, jobs) = watcher(dir.path());
        let root = watcher.root().to_path_buf();
        let (handle, thread) = watcher.spawn().unwrap();

        fs::create_dir_all(root.join("new/deeper")).unwrap();
        let file = root.join("new/deeper/data.txt");
        fs::write(&file, b"payload").unwrap();
        expect_once(&jobs, &file);

        handle.shutdown();
        let outcome = thread.join().unwrap().unwrap();
        assert!(outcome.directories.contains(&root.join("new/deeper")));
        outcome.pool.join();
    }

    #[test]
    fn test_reports_scenario() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("reports")).unwrap();
        fs::write(dir.path().join("reports/q1.csv"), b"old").unwrap();

        let (watcher, jobs) = watcher(dir.path());
        let root = watcher.root().to_path_buf();
        let (handle, thread) = watcher.spawn().unwrap();

        let q2 = root.join("reports/q2.csv");
        fs::write(&q2, b"q2").unwrap();
        expect_once(&jobs, &q2);

        fs::create_dir(root.join("archive")).unwrap();
        let q3 = root.join("archive/q3.csv");
        fs::write(&q3, b"q3").unwrap();
        expect_once(&jobs, &q3);

        handle.shutdown();
        let outcome = thread.join().unwrap().unwrap();
        assert!(outcome.directories.contains(&root.join("archive")));
        assert_eq!(outcome.summary.jobs_dispatched, 2);
        outcome.pool.join();
    }

    #[test]
    fn test_overflow_does_not_stop_loop() {
        let dir = tempdir().unwrap();
        let (watcher, jobs) = watcher(dir.path());
        let root = watcher.root().to_path_buf();
        let (handle, thread) = watcher.spawn().unwrap();

        handle.inject(Event::new(EventKind::Other).set_flag(Flag::Rescan));
        let file = root.join("after-overflow.txt");
        fs::write(&file, b"still seen").unwrap();
        expect_once(&jobs, &file);

        handle.shutdown();
        let outcome = thread.join().unwrap().unwrap();
        assert_eq!(outcome.summary.overflows, 1);
        outcome.pool.join();
    }

    #[test]
    fn test_deleted_directories_deregistered_until_empty() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        let (mut watcher, _) = watcher(dir.path());
        let root = watcher.root().to_path_buf();
        let sub = root.join("sub");

        fs::remove_dir_all(&sub).unwrap();
        let removed = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(sub.clone());
        assert_eq!(
            watcher.handle_signal(WatchSignal::Fs(Ok(removed))).unwrap(),
            LoopControl::Continue
        );
        assert!(!watcher.is_registered(&sub));
        assert!(!watcher.is_registered(&sub.join("inner")));
        assert_eq!(watcher.registered_directories(), vec![root.clone()]);

        fs::remove_dir(&root).unwrap();
        let gone = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root.clone());
        assert_eq!(
            watcher.handle_signal(WatchSignal::Fs(Ok(gone))).unwrap(),
            LoopControl::Break
        );
        assert!(watcher.registered_directories().is_empty());
    }

    #[test]
    fn test_moved_in_directory_registered_and_seeded() {
        let dir = tempdir().unwrap();
        let (mut watcher, jobs) = watcher(dir.path());
        let root = watcher.root().to_path_buf();

        let moved = root.join("moved");
        fs::create_dir(&moved).unwrap();
        let file = moved.join("carried.txt");
        fs::write(&file, b"x").unwrap();

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(moved.clone());
        watcher.handle_signal(WatchSignal::Fs(Ok(renamed))).unwrap();
        assert!(watcher.is_registered(&moved));
        assert_eq!(jobs.recv_timeout(WAIT).unwrap(), file);

        // A late creation event for the seeded file is swallowed
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone());
        watcher.handle_signal(WatchSignal::Fs(Ok(created))).unwrap();
        assert!(jobs.recv_timeout(QUIET).is_err());
        assert_eq!(watcher.summary.jobs_dispatched, 1);
    }

    /// Moves `name` in as a directory holding one file and returns that file
    fn move_in_with_file(watcher: &mut DirectoryWatcher, name: &str, file_name: &str) -> PathBuf {
        let moved = watcher.root().join(name);
        fs::create_dir(&moved).unwrap();
        let file = moved.join(file_name);
        fs::write(&file, b"first").unwrap();
        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(moved);
        watcher.handle_signal(WatchSignal::Fs(Ok(renamed))).unwrap();
        file
    }

    #[test]
    fn test_recreated_seeded_file_dispatched_again() {
        let dir = tempdir().unwrap();
        let (mut watcher, jobs) = watcher(dir.path());
        let file = move_in_with_file(&mut watcher, "moved", "daily.csv");
        assert_eq!(jobs.recv_timeout(WAIT).unwrap(), file);

        fs::remove_file(&file).unwrap();
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(file.clone());
        watcher.handle_signal(WatchSignal::Fs(Ok(removed))).unwrap();

        fs::write(&file, b"second").unwrap();
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone());
        watcher.handle_signal(WatchSignal::Fs(Ok(created))).unwrap();

        assert_eq!(jobs.recv_timeout(WAIT).unwrap(), file);
        assert_eq!(watcher.summary.jobs_dispatched, 2);
    }

    #[test]
    fn test_removed_directory_forgets_seeded_files() {
        let dir = tempdir().unwrap();
        let (mut watcher, jobs) = watcher(dir.path());
        let file = move_in_with_file(&mut watcher, "batch", "q1.csv");
        assert_eq!(jobs.recv_timeout(WAIT).unwrap(), file);

        let batch = watcher.root().join("batch");
        let moved_out = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From))).add_path(batch.clone());
        watcher.handle_signal(WatchSignal::Fs(Ok(moved_out))).unwrap();
        assert!(watcher.seeded.is_empty());
    }

    #[test]
    fn test_stale_seed_does_not_swallow_new_file() {
        let dir = tempdir().unwrap();
        let (mut watcher, jobs) = watcher(dir.path());
        watcher.seed_window = Duration::ZERO;
        let file = move_in_with_file(&mut watcher, "moved", "report.csv");
        assert_eq!(jobs.recv_timeout(WAIT).unwrap(), file);

        // A file renamed over the seeded path, with no removal event in between
        let created = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(file.clone());
        watcher.handle_signal(WatchSignal::Fs(Ok(created))).unwrap();
        assert_eq!(jobs.recv_timeout(WAIT).unwrap(), file);
    }

    #[test]
    fn test_events_outside_tree_ignored() {
        let dir = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let stray = elsewhere.path().join("stray.txt");
        fs::write(&stray, b"x").unwrap();

        let (mut watcher, jobs) = watcher(dir.path());
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(stray);
        assert_eq!(
            watcher.handle_signal(WatchSignal::Fs(Ok(created))).unwrap(),
            LoopControl::Continue
        );
        assert!(jobs.recv_timeout(QUIET).is_err());
    }
}
