//! Stash lifecycle controller.
//!
//! The [`Controller`] is the single entry point front-ends use to mount,
//! unmount, pull, push, create and list stashes. Every call works on a fresh
//! configuration snapshot and a fresh mount table query, checks the
//! preconditions of the requested transition, runs the external tool and
//! records the outcome back into the configuration file.
//!
//! Mutating calls hold the stash's [`StashLock`] for their whole duration, so
//! the precondition check and the transition cannot interleave with another
//! caller working on the same stash.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{self, Config, ConfigStore, keys};
use crate::credentials;
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{Executor, Invocation, OutputMode, run_checked};
use crate::lock::StashLock;
use crate::mount::{self, MountSource, PassphraseSource};
use crate::stash::{self, PASSPHRASE_FILE, RegistryPolicy, Stash, StashRegistry};
use crate::sync::{self, Direction};
use crate::watcher::{
    ChangeWatcher, DEFAULT_FLUSH_TICKS, DEFAULT_TICK, FlushHook, WatchLease, WatchTarget,
};

/// Metadata file the encryption tool writes into a new vault.
const GENERATED_CREDENTIAL_FILE: &str = ".encfs6.xml";

/// How mounted stashes get their change watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WatchMode {
    /// Worker thread inside this process. Ends with the controller.
    #[default]
    Thread,
    /// Detached `<program> --config <config> watch <stash>` child.
    Process { program: PathBuf, config: PathBuf },
    /// Never watch.
    Off,
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Overrides `general.on_invalid_stash` when set.
    pub policy: Option<RegistryPolicy>,
    pub watch: WatchMode,
    /// Pause between initializing a new vault and unmounting it.
    pub settle: Duration,
    pub tick: Duration,
    pub flush_ticks: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy: None,
            watch: WatchMode::default(),
            settle: Duration::from_secs(1),
            tick: DEFAULT_TICK,
            flush_ticks: DEFAULT_FLUSH_TICKS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Dry run.
    pub test: bool,
    /// Do not start a change watcher.
    pub nosync: bool,
    /// Command printing the passphrase, used when no passphrase is saved.
    pub passphrase_command: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnmountOptions {
    /// Dry run.
    pub test: bool,
    /// Skip the automatic push of pending changes.
    pub nosync: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Dry run.
    pub test: bool,
    pub output: OutputMode,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// New vault directory; its basename names the stash.
    pub root_dir: PathBuf,
    /// Mount the stash once created.
    pub mount: bool,
    /// Ask for the passphrase and store it encrypted.
    pub save_pass: bool,
}

/// What a lifecycle call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Dry run passed its checks; these commands would have run.
    WouldRun(Vec<String>),
}

/// Derived state of a stash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashState {
    Unmounted,
    Mounted,
    /// Holds changes not yet pushed, mounted or not.
    MountedDirty,
    MountedWatched,
}

impl StashState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StashState::Unmounted => "unmounted",
            StashState::Mounted => "mounted",
            StashState::MountedDirty => "dirty",
            StashState::MountedWatched => "watched",
        }
    }
}

impl std::fmt::Display for StashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stashes a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListFilter {
    #[default]
    Mounted,
    Unmounted,
    All,
}

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    pub name: String,
    pub state: StashState,
    pub mounted: bool,
    pub vault_root: PathBuf,
    /// Set while mounted.
    pub mount_point: Option<PathBuf>,
    pub remote: Option<String>,
    /// Disk usage of the vault root; only filled by [`Controller::list`].
    pub size: Option<String>,
}

/// Config snapshot with everything derived from it.
struct Snapshot {
    registry: StashRegistry,
    mount_root: PathBuf,
}

/// Entry point for stash lifecycle operations.
pub struct Controller {
    store: ConfigStore,
    executor: Arc<dyn Executor>,
    mounts: Arc<dyn MountSource>,
    watcher: ChangeWatcher,
    settings: Settings,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("store", &self.store)
            .field("watcher", &self.watcher)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Controller {
    /// Builds a controller without touching the file system.
    pub fn new(
        store: ConfigStore,
        executor: Arc<dyn Executor>,
        mounts: Arc<dyn MountSource>,
        settings: Settings,
    ) -> Self {
        let hook = flush_hook(&store, &executor, &mounts, settings.policy);
        let watcher = ChangeWatcher::new(store.clone(), Arc::clone(&executor))
            .with_flush_hook(hook)
            .with_timing(settings.tick, settings.flush_ticks);

        Self {
            store,
            executor,
            mounts,
            watcher,
            settings,
        }
    }

    /// Builds a controller and heals the configuration: defaults are filled
    /// in and saved, and watch leases left by dead processes are cleared.
    pub fn open(
        store: ConfigStore,
        executor: Arc<dyn Executor>,
        mounts: Arc<dyn MountSource>,
        settings: Settings,
    ) -> Result<Self> {
        let controller = Self::new(store, executor, mounts, settings);

        let config = controller.store.load()?.ensure_defaults()?;
        controller.store.save(&config)?;

        let registry = controller.build_registry(&config)?;
        controller.watcher.clear_orphans(&registry);
        Ok(controller)
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn build_registry(&self, config: &Config) -> Result<StashRegistry> {
        let policy = self
            .settings
            .policy
            .unwrap_or_else(|| config.registry_policy());
        StashRegistry::build(config, &self.store.base_dir(), policy)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let config = self.store.load()?;
        let registry = self.build_registry(&config)?;
        let mount_root = resolve_mount_root(&config)?;
        Ok(Snapshot {
            registry,
            mount_root,
        })
    }

    /// Rebuilds the registry from the file on disk.
    pub fn registry(&self) -> Result<StashRegistry> {
        let config = self.store.load()?;
        self.build_registry(&config)
    }

    fn mounted(&self, snap: &Snapshot) -> Result<BTreeSet<String>> {
        mount::mounted_stashes(self.mounts.as_ref(), snap.registry.names(), &snap.mount_root)
    }

    fn is_mounted(&self, snap: &Snapshot, name: &str) -> Result<bool> {
        Ok(mount::mounted_stashes(self.mounts.as_ref(), [name], &snap.mount_root)?.contains(name))
    }

    /// Stamps `key` with the current time. Failures only warn: the
    /// transition itself already happened.
    fn record(&self, name: &str, key: &str) -> Option<Config> {
        let now = config::now_timestamp().to_string();
        match self.store.update(|c| c.set(name, key, now)) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("failed to record {} for {}: {}", key, name, e);
                None
            }
        }
    }

    /// Mounts `name` at `<mount_root>/<name>`.
    pub fn mount(&self, name: &str, opts: &MountOptions) -> Result<Outcome> {
        let snap = self.snapshot()?;
        let stash = snap.registry.get(name)?;
        let _lock = lock_unless(opts.test, stash)?;

        if self.is_mounted(&snap, name)? {
            return Err(Error::mount(name, "already mounted"));
        }
        let mount_point = stash.mount_point(&snap.mount_root);
        mount::prepare_empty_dir(&mount_point, !opts.test)?;

        if opts.test {
            let mut commands = Vec::new();
            let source = match (&stash.passphrase_file, &opts.passphrase_command) {
                (Some(file), _) => {
                    commands.push(format!("gpg --quiet --decrypt {}", file.display()));
                    PassphraseSource::Stdin(Vec::new())
                }
                (None, Some(cmd)) => PassphraseSource::Command(cmd.clone()),
                (None, None) => PassphraseSource::Prompt,
            };
            commands.push(mount::encfs_mount(stash, &mount_point, source).command_line());
            return Ok(Outcome::WouldRun(commands));
        }

        let source = match (&stash.passphrase_file, &opts.passphrase_command) {
            (Some(file), _) => {
                PassphraseSource::Stdin(credentials::decrypt_passphrase(self.executor.as_ref(), file)?)
            }
            (None, Some(cmd)) => PassphraseSource::Command(cmd.clone()),
            (None, None) => PassphraseSource::Prompt,
        };
        run_checked(
            self.executor.as_ref(),
            &mount::encfs_mount(stash, &mount_point, source),
        )?;
        info!("mounted {} at {}", name, mount_point.display());
        self.record(name, keys::LAST_MOUNT);

        if stash.sync_enabled() && !opts.nosync {
            self.start_watch(stash);
        }
        Ok(Outcome::Applied)
    }

    fn start_watch(&self, stash: &Stash) {
        let result = match &self.settings.watch {
            WatchMode::Off => return,
            WatchMode::Thread => self.watcher.start(&WatchTarget::for_stash(stash)),
            WatchMode::Process { program, config } => {
                self.spawn_watch_process(stash, program, config)
            }
        };
        if let Err(e) = result {
            warn!("could not watch {}: {}", stash.name, e);
        }
    }

    fn spawn_watch_process(&self, stash: &Stash, program: &Path, config: &Path) -> Result<()> {
        if self.watcher.is_watched(&stash.name, &stash.config_path) {
            return Err(Error::WatchActive {
                name: stash.name.clone(),
            });
        }
        let mut args = vec!["--config".to_string(), config.display().to_string()];
        if self.settings.policy == Some(RegistryPolicy::SkipInvalid) {
            args.push("--skip-invalid".to_string());
        }
        args.extend(["watch".to_string(), stash.name.clone()]);
        let inv = Invocation::new(program.display().to_string()).args(args);
        let pid = self.executor.spawn_detached(&inv)?;
        WatchLease::new(pid, &stash.vault_root).write(&stash.config_path)?;
        info!("watcher process {} started for {}", pid, stash.name);
        Ok(())
    }

    /// Unmounts `name`, stops its watcher and pushes pending changes.
    pub fn unmount(&self, name: &str, opts: &UnmountOptions) -> Result<Outcome> {
        let snap = self.snapshot()?;
        let stash = snap.registry.get(name)?;
        let _lock = lock_unless(opts.test, stash)?;

        if !self.is_mounted(&snap, name)? {
            return Err(Error::mount(name, "not mounted"));
        }
        let mount_point = stash.mount_point(&snap.mount_root);
        let inv = mount::fusermount_unmount(&mount_point);

        if opts.test {
            let mut commands = vec![inv.command_line()];
            if let Some(remote) = &stash.remote_path
                && stash.dirty
                && !opts.nosync
            {
                commands.push(
                    sync::rsync(&stash.vault_root, remote, Direction::Push, OutputMode::Capture)
                        .command_line(),
                );
            }
            return Ok(Outcome::WouldRun(commands));
        }

        run_checked(self.executor.as_ref(), &inv)?;
        info!("unmounted {}", name);

        if let Err(e) = self.watcher.stop(name, &stash.config_path) {
            warn!("failed to stop watching {}: {}", name, e);
        }

        // The watcher may have flagged changes after the snapshot was taken.
        let dirty = match self.record(name, keys::LAST_UNMOUNT) {
            Some(config) => config.get(name, keys::LAST_CHANGE).is_some(),
            None => stash.dirty,
        };
        if let Some(remote) = &stash.remote_path
            && dirty
            && !opts.nosync
        {
            info!("{} has unpushed changes, pushing", name);
            self.push_locked(stash, remote, OutputMode::Passthrough)?;
        }
        Ok(Outcome::Applied)
    }

    /// Mirrors the remote into the vault root.
    pub fn pull(&self, name: &str, opts: &SyncOptions) -> Result<Outcome> {
        let snap = self.snapshot()?;
        let stash = snap.registry.get(name)?;
        let _lock = lock_unless(opts.test, stash)?;

        if self.is_mounted(&snap, name)? {
            return Err(Error::mount(name, "mounted; unmount before pulling"));
        }
        let remote = stash
            .remote_path
            .as_deref()
            .ok_or_else(|| Error::NoRemoteConfigured {
                name: name.to_string(),
            })?;
        if stash.dirty {
            return Err(Error::MustBePushed {
                name: name.to_string(),
            });
        }

        let inv = sync::rsync(&stash.vault_root, remote, Direction::Pull, opts.output);
        if opts.test {
            return Ok(Outcome::WouldRun(vec![inv.command_line()]));
        }
        run_checked(self.executor.as_ref(), &inv)?;
        info!("pulled {} from {}", name, remote);
        Ok(Outcome::Applied)
    }

    /// Mirrors the vault root to the remote and clears the dirty flag.
    pub fn push(&self, name: &str, opts: &SyncOptions) -> Result<Outcome> {
        let snap = self.snapshot()?;
        let stash = snap.registry.get(name)?;
        let remote = stash
            .remote_path
            .as_deref()
            .ok_or_else(|| Error::NoRemoteConfigured {
                name: name.to_string(),
            })?;

        if opts.test {
            let inv = sync::rsync(&stash.vault_root, remote, Direction::Push, opts.output);
            return Ok(Outcome::WouldRun(vec![inv.command_line()]));
        }
        let _lock = StashLock::acquire(&stash.lock_file())?;
        self.push_locked(stash, remote, opts.output)?;
        Ok(Outcome::Applied)
    }

    /// Pushes unless another operation holds the stash.
    ///
    /// Returns false when the stash was busy.
    pub fn flush(&self, name: &str) -> Result<bool> {
        let snap = self.snapshot()?;
        let stash = snap.registry.get(name)?;
        let remote = stash
            .remote_path
            .as_deref()
            .ok_or_else(|| Error::NoRemoteConfigured {
                name: name.to_string(),
            })?;

        let Some(_lock) = StashLock::try_acquire(&stash.lock_file())? else {
            debug!("{} is busy, postponing push", name);
            return Ok(false);
        };
        self.push_locked(stash, remote, OutputMode::Capture)?;
        Ok(true)
    }

    fn push_locked(&self, stash: &Stash, remote: &str, output: OutputMode) -> Result<()> {
        let name = stash.name.as_str();
        let started = config::now_timestamp();
        let inv = sync::rsync(&stash.vault_root, remote, Direction::Push, output);
        run_checked(self.executor.as_ref(), &inv)?;

        self.store.update(|c| {
            // Changes flagged after the transfer started stay pending.
            let stale = c
                .get(name, keys::LAST_CHANGE)
                .and_then(|v| v.parse::<u64>().ok())
                .is_none_or(|changed| changed <= started);
            if stale {
                c.remove(name, keys::LAST_CHANGE);
            }
            c.set(name, keys::LAST_PUSH, config::now_timestamp().to_string());
        })?;
        info!("pushed {} to {}", name, remote);
        Ok(())
    }

    /// Initializes a new vault and registers it. Returns the stash name.
    pub fn create(&self, opts: &CreateOptions) -> Result<String> {
        self.create_with(opts, credentials::prompt_new_passphrase)
    }

    /// Same as [`Controller::create`] with a custom passphrase prompt.
    pub fn create_with(
        &self,
        opts: &CreateOptions,
        prompt: impl FnOnce() -> Result<String>,
    ) -> Result<String> {
        let root_dir = std::path::absolute(&opts.root_dir).file_context(&opts.root_dir)?;
        let name = root_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidStashName {
                name: root_dir.display().to_string(),
            })?
            .to_string();
        stash::validate_name(&name)?;

        let config = self.store.load()?;
        if config.has_section(&name) {
            return Err(Error::StashExists { name });
        }
        let mount_point = resolve_mount_root(&config)?.join(&name);
        let config_path = self.store.base_dir().join(&name);

        mount::prepare_empty_dir(&root_dir, true)?;
        mount::prepare_empty_dir(&mount_point, true)?;
        config::check_dir(&config_path)?;
        let lock = StashLock::acquire(&config_path.join(".lock"))?;

        run_checked(
            self.executor.as_ref(),
            &mount::encfs_create(&root_dir, &mount_point),
        )?;
        std::thread::sleep(self.settings.settle);
        run_checked(self.executor.as_ref(), &mount::fusermount_unmount(&mount_point))?;

        let credential_file = config_path.join(stash::CREDENTIAL_FILE);
        move_file(&root_dir.join(GENERATED_CREDENTIAL_FILE), &credential_file)?;
        stash::restrict_to_owner(&credential_file)?;

        if opts.save_pass {
            let passphrase = prompt()?;
            let file = config_path.join(PASSPHRASE_FILE);
            credentials::encrypt_passphrase(self.executor.as_ref(), passphrase.as_bytes(), &file)?;
            stash::restrict_to_owner(&file)?;
        }

        let default_root = config.vault_root().map(|root| root.join(&name));
        self.store.update(|c| {
            c.section_mut(&name);
            if default_root.as_deref() != Some(root_dir.as_path()) {
                c.set(&name, keys::ENCFS_ROOT, root_dir.display().to_string());
            }
        })?;
        info!("created stash {} in {}", name, root_dir.display());

        drop(lock);
        if opts.mount {
            self.mount(&name, &MountOptions::default())?;
        }
        Ok(name)
    }

    /// Lists stashes matching `filter`, with the disk usage of each vault.
    pub fn list(&self, filter: ListFilter) -> Result<Vec<StashEntry>> {
        let mut entries = self.list_brief(filter)?;
        for entry in &mut entries {
            entry.size = stash::disk_usage(self.executor.as_ref(), &entry.vault_root);
        }
        Ok(entries)
    }

    /// Same as [`Controller::list`] without running `du`.
    pub fn list_brief(&self, filter: ListFilter) -> Result<Vec<StashEntry>> {
        let snap = self.snapshot()?;
        let mounted = self.mounted(&snap)?;

        let entries = snap
            .registry
            .iter()
            .filter_map(|stash| {
                let is_mounted = mounted.contains(&stash.name);
                let keep = match filter {
                    ListFilter::Mounted => is_mounted,
                    ListFilter::Unmounted => !is_mounted,
                    ListFilter::All => true,
                };
                keep.then(|| StashEntry {
                    name: stash.name.clone(),
                    state: self.state_of(stash, is_mounted),
                    mounted: is_mounted,
                    vault_root: stash.vault_root.clone(),
                    mount_point: is_mounted.then(|| stash.mount_point(&snap.mount_root)),
                    remote: stash.remote_path.clone(),
                    size: None,
                })
            })
            .collect();
        Ok(entries)
    }

    /// Derived state of one stash.
    pub fn state(&self, name: &str) -> Result<StashState> {
        let snap = self.snapshot()?;
        let stash = snap.registry.get(name)?;
        let mounted = self.is_mounted(&snap, name)?;
        Ok(self.state_of(stash, mounted))
    }

    fn state_of(&self, stash: &Stash, mounted: bool) -> StashState {
        if stash.dirty {
            StashState::MountedDirty
        } else if !mounted {
            StashState::Unmounted
        } else if self.watcher.is_watched(&stash.name, &stash.config_path) {
            StashState::MountedWatched
        } else {
            StashState::Mounted
        }
    }

    /// Runs the watcher for a mounted stash on this thread until it is
    /// stopped. Used by the detached watch process.
    pub fn watch(&self, name: &str) -> Result<()> {
        let snap = self.snapshot()?;
        let stash = snap.registry.get(name)?;
        if !self.is_mounted(&snap, name)? {
            return Err(Error::mount(name, "not mounted"));
        }
        self.watcher.start(&WatchTarget::for_stash(stash))?;
        self.watcher.wait(name);
        info!("stopped watching {}", name);
        Ok(())
    }
}

/// Configured mount root, `~/Private` when the config never got defaults.
fn resolve_mount_root(config: &Config) -> Result<PathBuf> {
    match config.mount_root() {
        Some(root) => Ok(root),
        None => Ok(dirs::home_dir().ok_or(Error::HomeDirNotFound)?.join("Private")),
    }
}

fn lock_unless(test: bool, stash: &Stash) -> Result<Option<StashLock>> {
    if test {
        Ok(None)
    } else {
        StashLock::acquire(&stash.lock_file()).map(Some)
    }
}

/// Flush hook pushing through a short-lived controller that never watches.
fn flush_hook(
    store: &ConfigStore,
    executor: &Arc<dyn Executor>,
    mounts: &Arc<dyn MountSource>,
    policy: Option<RegistryPolicy>,
) -> FlushHook {
    let store = store.clone();
    let executor = Arc::clone(executor);
    let mounts = Arc::clone(mounts);
    Arc::new(move |name| {
        let settings = Settings {
            policy,
            watch: WatchMode::Off,
            ..Settings::default()
        };
        Controller::new(store.clone(), Arc::clone(&executor), Arc::clone(&mounts), settings)
            .flush(name)
    })
}

/// Renames, falling back to copy and delete across file systems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if !from.is_file() {
        return Err(Error::FileNotFound {
            path: from.to_path_buf(),
        });
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).file_context(to)?;
    fs::remove_file(from).file_context(from)
}
