//! Change watcher for mounted stashes.
//!
//! A watcher observes a stash's vault root recursively and flags the stash
//! dirty (a `last_change` timestamp in the config file) when its ciphertext
//! changes. It never synchronizes by itself; a periodic flush hands
//! accumulated changes to a caller-supplied hook, normally a push.
//!
//! Each watch runs on a worker thread fed by the notification facility and
//! stopped through a channel. A JSON lease record in the stash config
//! directory outlives the process so other processes can tell that a watch is
//! active, stop it by removing the lease, and clear it when the owner died.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{self, ConfigStore, keys};
use crate::error::{Error, IoResultExt, Result};
use crate::executor::Executor;
use crate::stash::{Stash, StashRegistry};
use crate::sync;

/// Lease record file name inside the stash config directory.
pub const LEASE_FILE: &str = "watch.lease";

/// Interval between bookkeeping ticks.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Number of ticks between flush attempts.
pub const DEFAULT_FLUSH_TICKS: u32 = 30;

/// Called with the stash name when accumulated changes should be pushed.
///
/// Returns `Ok(true)` when the changes were flushed, `Ok(false)` when the
/// stash was busy and the flush should be retried later.
pub type FlushHook = Arc<dyn Fn(&str) -> Result<bool> + Send + Sync>;

/// Persisted record of an active watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchLease {
    /// Process owning the watch.
    pub pid: u32,
    /// Watched directory.
    pub path: PathBuf,
    /// Unix seconds.
    pub started_at: u64,
}

impl WatchLease {
    /// Creates a lease for the given process.
    pub fn new(pid: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            path: path.into(),
            started_at: config::now_timestamp(),
        }
    }

    /// Lease path for a stash config directory.
    pub fn file(config_path: &Path) -> PathBuf {
        config_path.join(LEASE_FILE)
    }

    /// Reads the lease, `None` when there is none.
    pub fn read(config_path: &Path) -> Result<Option<Self>> {
        let path = Self::file(config_path);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).file_context(&path),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::Lease {
                path,
                message: e.to_string(),
            })
    }

    /// Writes the lease through a temporary file so readers never see a
    /// partial record.
    pub fn write(&self, config_path: &Path) -> Result<()> {
        let path = Self::file(config_path);
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Lease {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let tmp = path.with_extension("lease.tmp");
        fs::write(&tmp, json).file_context(&tmp)?;
        fs::rename(&tmp, &path).file_context(&path)
    }

    /// Deletes the lease. Returns false when there was none.
    pub fn remove(config_path: &Path) -> Result<bool> {
        let path = Self::file(config_path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).file_context(&path),
        }
    }

    /// Returns true if the owning process is still running.
    pub fn is_alive(&self) -> bool {
        process_alive(self.pid)
    }

    /// Returns true if the current process owns the lease.
    pub fn is_own(&self) -> bool {
        self.pid == std::process::id()
    }
}

/// Checks a pid with the null signal.
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// What a watch observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub name: String,
    pub config_path: PathBuf,
    pub watched_path: PathBuf,
}

impl WatchTarget {
    /// Watches the stash's vault root, so changes are seen at the ciphertext layer.
    pub fn for_stash(stash: &Stash) -> Self {
        Self {
            name: stash.name.clone(),
            config_path: stash.config_path.clone(),
            watched_path: stash.vault_root.clone(),
        }
    }
}

enum WatchMsg {
    Event(notify::Result<Event>),
    Stop,
}

struct ActiveWatch {
    tx: Sender<WatchMsg>,
    handle: JoinHandle<()>,
    config_path: PathBuf,
    _watcher: RecommendedWatcher,
}

/// Registry of in-process watches.
pub struct ChangeWatcher {
    store: ConfigStore,
    executor: Arc<dyn Executor>,
    flush: Option<FlushHook>,
    tick: Duration,
    flush_ticks: u32,
    active: Mutex<HashMap<String, ActiveWatch>>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("store", &self.store)
            .field("tick", &self.tick)
            .field("flush_ticks", &self.flush_ticks)
            .field("active", &self.lock_active().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ChangeWatcher {
    pub fn new(store: ConfigStore, executor: Arc<dyn Executor>) -> Self {
        Self {
            store,
            executor,
            flush: None,
            tick: DEFAULT_TICK,
            flush_ticks: DEFAULT_FLUSH_TICKS,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the hook invoked when accumulated changes should be pushed.
    pub fn with_flush_hook(mut self, hook: FlushHook) -> Self {
        self.flush = Some(hook);
        self
    }

    /// Overrides the tick interval and the number of ticks between flushes.
    pub fn with_timing(mut self, tick: Duration, flush_ticks: u32) -> Self {
        self.tick = tick;
        self.flush_ticks = flush_ticks.max(1);
        self
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ActiveWatch>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts watching `target` on a worker thread.
    ///
    /// Fails with `WatchActive` when this process or a live external process
    /// already watches the stash.
    pub fn start(&self, target: &WatchTarget) -> Result<()> {
        let mut active = self.lock_active();
        active.retain(|_, w| !w.handle.is_finished());

        if active.contains_key(&target.name) {
            return Err(Error::WatchActive {
                name: target.name.clone(),
            });
        }

        if let Some(lease) = WatchLease::read(&target.config_path)? {
            if !lease.is_own() && lease.is_alive() {
                return Err(Error::WatchActive {
                    name: target.name.clone(),
                });
            }
            if !lease.is_own() {
                warn!(
                    "clearing orphaned watch on {} left by process {}",
                    target.name, lease.pid
                );
            }
        }

        let (tx, rx) = mpsc::channel();
        let event_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(WatchMsg::Event(res));
        })
        .map_err(|source| Error::Watch {
            path: target.watched_path.clone(),
            source,
        })?;
        watcher
            .watch(&target.watched_path, RecursiveMode::Recursive)
            .map_err(|source| Error::Watch {
                path: target.watched_path.clone(),
                source,
            })?;

        WatchLease::new(std::process::id(), &target.watched_path).write(&target.config_path)?;

        let worker = Worker {
            target: target.clone(),
            store: self.store.clone(),
            executor: Arc::clone(&self.executor),
            flush: self.flush.clone(),
            tick: self.tick,
            flush_ticks: self.flush_ticks,
        };
        let handle = std::thread::Builder::new()
            .name(format!("watch-{}", target.name))
            .spawn(move || worker.run(rx))
            .map_err(|e| Error::Lease {
                path: WatchLease::file(&target.config_path),
                message: format!("failed to spawn watcher thread: {}", e),
            })?;

        info!(
            "watching {} for {}",
            target.watched_path.display(),
            target.name
        );
        active.insert(
            target.name.clone(),
            ActiveWatch {
                tx,
                handle,
                config_path: target.config_path.clone(),
                _watcher: watcher,
            },
        );
        Ok(())
    }

    /// Stops the watch on `name`.
    ///
    /// In-process watches are stopped through their channel. A watch owned
    /// by another process is asked to stop by removing its lease. Returns
    /// false, with a warning, when nothing was watching.
    pub fn stop(&self, name: &str, config_path: &Path) -> Result<bool> {
        let entry = self.lock_active().remove(name);
        if let Some(watch) = entry {
            let _ = watch.tx.send(WatchMsg::Stop);
            drop(watch._watcher);
            if watch.handle.join().is_err() {
                warn!("watcher thread for {} panicked", name);
            }
            WatchLease::remove(&watch.config_path)?;
            info!("stopped watching {}", name);
            return Ok(true);
        }

        match WatchLease::read(config_path)? {
            Some(lease) if lease.is_alive() && !lease.is_own() => {
                WatchLease::remove(config_path)?;
                info!("asked watcher process {} to stop watching {}", lease.pid, name);
                Ok(true)
            }
            Some(lease) => {
                WatchLease::remove(config_path)?;
                warn!("{} had a stale watch lease from process {}", name, lease.pid);
                Ok(false)
            }
            None => {
                warn!("{} is not watched", name);
                Ok(false)
            }
        }
    }

    /// Returns true if this process or a live external process watches `name`.
    pub fn is_watched(&self, name: &str, config_path: &Path) -> bool {
        if self
            .lock_active()
            .get(name)
            .is_some_and(|w| !w.handle.is_finished())
        {
            return true;
        }

        match WatchLease::read(config_path) {
            Ok(Some(lease)) if lease.is_alive() => {
                if !lease.is_own() {
                    info!("{} is watched by process {}", name, lease.pid);
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("ignoring unreadable watch lease for {}: {}", name, e);
                false
            }
        }
    }

    /// Blocks until the in-process watch on `name` ends.
    pub fn wait(&self, name: &str) {
        let entry = self.lock_active().remove(name);
        if let Some(watch) = entry
            && watch.handle.join().is_err()
        {
            warn!("watcher thread for {} panicked", name);
        }
    }

    /// Removes leases whose owner is gone, so they never block future mounts.
    pub fn clear_orphans(&self, registry: &StashRegistry) -> Vec<String> {
        let mut cleared = Vec::new();
        for stash in registry.iter() {
            let orphaned = match WatchLease::read(&stash.config_path) {
                Ok(Some(lease)) => !lease.is_alive(),
                Ok(None) => false,
                Err(_) => true,
            };
            if orphaned {
                match WatchLease::remove(&stash.config_path) {
                    Ok(_) => {
                        warn!("cleared orphaned watch lease for {}", stash.name);
                        cleared.push(stash.name.clone());
                    }
                    Err(e) => warn!("failed to clear watch lease for {}: {}", stash.name, e),
                }
            }
        }
        cleared
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        let active: Vec<(String, ActiveWatch)> = self.lock_active().drain().collect();
        for (name, watch) in active {
            let _ = watch.tx.send(WatchMsg::Stop);
            let _ = watch.handle.join();
            if let Err(e) = WatchLease::remove(&watch.config_path) {
                warn!("failed to remove watch lease for {}: {}", name, e);
            }
        }
    }
}

/// State owned by a watch thread.
struct Worker {
    target: WatchTarget,
    store: ConfigStore,
    executor: Arc<dyn Executor>,
    flush: Option<FlushHook>,
    tick: Duration,
    flush_ticks: u32,
}

impl Worker {
    fn run(self, rx: mpsc::Receiver<WatchMsg>) {
        let name = self.target.name.as_str();
        let mut changed = false;
        let mut pending = false;
        let mut ticks: u32 = 0;
        let mut last_tick = Instant::now();

        loop {
            match rx.recv_timeout(self.tick) {
                Ok(WatchMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(WatchMsg::Event(Ok(event))) => {
                    if is_change(&event.kind) {
                        debug!("{}: {:?} {:?}", name, event.kind, event.paths);
                        changed = true;
                    }
                }
                Ok(WatchMsg::Event(Err(e))) => warn!("watch error on {}: {}", name, e),
                Err(RecvTimeoutError::Timeout) => {}
            }

            if last_tick.elapsed() < self.tick {
                continue;
            }
            last_tick = Instant::now();
            ticks = ticks.wrapping_add(1);

            if !self.lease_held() {
                info!("watch lease for {} withdrawn, stopping", name);
                return;
            }

            if changed {
                changed = false;
                pending = true;
                if let Err(e) = self.mark_dirty() {
                    warn!("failed to record change for {}: {}", name, e);
                }
            }

            if pending && ticks % self.flush_ticks == 0 {
                pending = !self.try_flush();
            }
        }

        if self.lease_held()
            && let Err(e) = WatchLease::remove(&self.target.config_path)
        {
            warn!("failed to remove watch lease for {}: {}", name, e);
        }
    }

    fn lease_held(&self) -> bool {
        matches!(
            WatchLease::read(&self.target.config_path),
            Ok(Some(lease)) if lease.is_own()
        )
    }

    fn mark_dirty(&self) -> Result<()> {
        let name = &self.target.name;
        let now = config::now_timestamp().to_string();
        self.store.update(|c| {
            if c.has_section(name) {
                c.set(name, keys::LAST_CHANGE, now);
            }
        })?;
        Ok(())
    }

    /// Returns true when nothing is left pending.
    fn try_flush(&self) -> bool {
        let Some(hook) = &self.flush else {
            return false;
        };
        let name = self.target.name.as_str();
        if sync::is_sync_running(self.executor.as_ref()) {
            debug!("sync already running, postponing flush of {}", name);
            return false;
        }
        match hook(name) {
            Ok(flushed) => flushed,
            Err(e) => {
                warn!("flushing {} failed: {}", name, e);
                false
            }
        }
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ToolOutput;
    use crate::testing::FakeExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Setup {
        _dir: TempDir,
        store: ConfigStore,
        target: WatchTarget,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("conf").join("vault1");
        let watched_path = dir.path().join("vault1");
        fs::create_dir_all(&config_path).unwrap();
        fs::create_dir_all(&watched_path).unwrap();

        let store = ConfigStore::new(dir.path().join("conf").join("stashctl.conf"));
        store.update(|c| c.set("vault1", keys::REMOTE_PATH, "r:/v")).unwrap();

        Setup {
            _dir: dir,
            store,
            target: WatchTarget {
                name: "vault1".to_string(),
                config_path,
                watched_path,
            },
        }
    }

    fn idle_executor() -> Arc<FakeExecutor> {
        let executor = Arc::new(FakeExecutor::new());
        executor.respond(
            "pgrep",
            ToolOutput {
                code: 1,
                ..ToolOutput::default()
            },
        );
        executor
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_change_marks_stash_dirty() {
        let s = setup();
        let watcher = ChangeWatcher::new(s.store.clone(), idle_executor())
            .with_timing(Duration::from_millis(50), 1000);

        watcher.start(&s.target).unwrap();
        assert!(watcher.is_watched("vault1", &s.target.config_path));

        fs::write(s.target.watched_path.join("block"), b"cipher").unwrap();
        assert!(wait_for(|| {
            s.store.load().unwrap().get("vault1", keys::LAST_CHANGE).is_some()
        }));

        assert!(watcher.stop("vault1", &s.target.config_path).unwrap());
        assert!(!watcher.is_watched("vault1", &s.target.config_path));
        assert!(WatchLease::read(&s.target.config_path).unwrap().is_none());
    }

    #[test]
    fn test_flush_hook_runs_after_changes() {
        let s = setup();
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushed);
        let hook: FlushHook = Arc::new(move |name| {
            assert_eq!(name, "vault1");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        let watcher = ChangeWatcher::new(s.store.clone(), idle_executor())
            .with_flush_hook(hook)
            .with_timing(Duration::from_millis(50), 2);

        watcher.start(&s.target).unwrap();
        fs::write(s.target.watched_path.join("block"), b"cipher").unwrap();

        assert!(wait_for(|| flushed.load(Ordering::SeqCst) > 0));
        watcher.stop("vault1", &s.target.config_path).unwrap();
    }

    #[test]
    fn test_flush_postponed_while_sync_running() {
        let s = setup();
        let executor = Arc::new(FakeExecutor::new());
        executor.respond("pgrep", ToolOutput::default());
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushed);
        let hook: FlushHook = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        let watcher = ChangeWatcher::new(s.store.clone(), executor.clone())
            .with_flush_hook(hook)
            .with_timing(Duration::from_millis(20), 1);

        watcher.start(&s.target).unwrap();
        fs::write(s.target.watched_path.join("block"), b"cipher").unwrap();

        assert!(wait_for(|| executor.count("pgrep") >= 3));
        assert_eq!(flushed.load(Ordering::SeqCst), 0);
        watcher.stop("vault1", &s.target.config_path).unwrap();
    }

    #[test]
    fn test_second_start_is_refused() {
        let s = setup();
        let watcher = ChangeWatcher::new(s.store.clone(), idle_executor());

        watcher.start(&s.target).unwrap();
        let err = watcher.start(&s.target).unwrap_err();
        assert!(matches!(err, Error::WatchActive { .. }));
        watcher.stop("vault1", &s.target.config_path).unwrap();
    }

    #[test]
    fn test_withdrawn_lease_stops_worker() {
        let s = setup();
        let watcher = ChangeWatcher::new(s.store.clone(), idle_executor())
            .with_timing(Duration::from_millis(20), 1000);

        watcher.start(&s.target).unwrap();
        WatchLease::remove(&s.target.config_path).unwrap();

        assert!(wait_for(|| !watcher.is_watched("vault1", &s.target.config_path)));
        watcher.wait("vault1");
    }

    #[test]
    fn test_stop_unwatched_is_noop() {
        let s = setup();
        let watcher = ChangeWatcher::new(s.store.clone(), idle_executor());
        assert!(!watcher.stop("vault1", &s.target.config_path).unwrap());
    }

    #[test]
    fn test_dead_owner_lease_is_not_a_watch() {
        let s = setup();
        WatchLease::new(i32::MAX as u32, &s.target.watched_path)
            .write(&s.target.config_path)
            .unwrap();

        let watcher = ChangeWatcher::new(s.store.clone(), idle_executor());
        assert!(!watcher.is_watched("vault1", &s.target.config_path));

        // A dead owner never blocks a new watch.
        watcher.start(&s.target).unwrap();
        let lease = WatchLease::read(&s.target.config_path).unwrap().unwrap();
        assert!(lease.is_own());
        watcher.stop("vault1", &s.target.config_path).unwrap();
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(i32::MAX as u32));
        assert!(!process_alive(0));
    }
}
