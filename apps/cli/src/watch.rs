//! Background watch process.
//!
//! `stashctl mount` starts this as a detached child in its own process group.
//! It watches one mounted stash until the stash is unmounted (which removes
//! the watch lease) or the process is signalled. There is no terminal, so
//! events go to `<config path>/watcher.log`.

use std::path::PathBuf;
use std::sync::Arc;

use stashctl_core::config::{ConfigStore, expand_tilde, keys};
use stashctl_core::{
    Controller, ProcMounts, RegistryPolicy, Result, Settings, SystemExecutor, WatchMode,
};
use tracing::{error, info};

use crate::logging;

const LOG_FILE: &str = "watcher.log";

fn log_file(store: &ConfigStore, name: &str) -> Result<PathBuf> {
    let config = store.load()?;
    let config_path = config
        .get(name, keys::CONFIG_PATH)
        .map(expand_tilde)
        .unwrap_or_else(|| store.base_dir().join(name));
    Ok(config_path.join(LOG_FILE))
}

/// Runs the watch loop for `name` in the foreground.
pub fn run(
    store: ConfigStore,
    name: &str,
    verbose: bool,
    policy: Option<RegistryPolicy>,
) -> Result<()> {
    let log_file = log_file(&store, name)?;
    if let Err(e) = logging::init(verbose, Some(&log_file)) {
        eprintln!("Warning: cannot log to {}: {}", log_file.display(), e);
    }

    let settings = Settings {
        policy,
        watch: WatchMode::Off,
        ..Settings::default()
    };
    let controller = Controller::new(
        store,
        Arc::new(SystemExecutor::new()),
        Arc::new(ProcMounts::default()),
        settings,
    );

    info!("watch process {} starting for {}", std::process::id(), name);
    controller.watch(name).inspect_err(|e| {
        error!("watching {} failed: {}", name, e);
    })
}
