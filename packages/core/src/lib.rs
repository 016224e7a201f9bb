//! stashctl-core: Core library for managing encrypted stashes.
//!
//! A stash is an encfs vault with a mount point, optional saved passphrase
//! and an optional rsync remote. This library tracks stashes in a config
//! file, mounts and unmounts them, mirrors them to and from their remote and
//! watches mounted stashes so pending changes get pushed.
//!
//! # Modules
//!
//! - [`config`]: INI config file parsing, defaults and persistence
//! - [`stash`]: Stash definitions and the registry built from the config
//! - [`mount`]: Mount table queries and encfs/fusermount invocations
//! - [`sync`]: rsync invocations and the sync-in-flight check
//! - [`credentials`]: gpg-encrypted passphrase storage
//! - [`lifecycle`]: The controller enforcing lifecycle transitions
//! - [`watcher`]: Change watcher and its lease record
//! - [`lock`]: Per-stash operation lock
//! - [`executor`]: External tool execution
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stashctl_core::{ConfigStore, Controller, ListFilter, ProcMounts, Settings, SystemExecutor};
//!
//! let store = ConfigStore::new(ConfigStore::default_path().unwrap());
//! let controller = Controller::open(
//!     store,
//!     Arc::new(SystemExecutor::new()),
//!     Arc::new(ProcMounts::default()),
//!     Settings::default(),
//! )
//! .unwrap();
//!
//! for entry in controller.list(ListFilter::All).unwrap() {
//!     println!("{} {}", entry.name, entry.state);
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod lock;
pub mod mount;
pub mod stash;
pub mod sync;
pub mod watcher;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, ConfigStore};
pub use error::{Error, Result};
pub use executor::{Executor, OutputMode, SystemExecutor};
pub use lifecycle::{
    Controller, CreateOptions, ListFilter, MountOptions, Outcome, Settings, StashEntry,
    StashState, SyncOptions, UnmountOptions, WatchMode,
};
pub use mount::{MountSource, ProcMounts};
pub use stash::{RegistryPolicy, Stash, StashRegistry};
