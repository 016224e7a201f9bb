//! Stash catalog module.
//!
//! A [`Stash`] is built from one configuration section and validated against
//! the files it needs on disk. The [`StashRegistry`] is rebuilt from a config
//! snapshot on every load; only the backing section is ever persisted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{self, Config, GENERAL, keys};
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{Executor, Invocation};

/// Encryption-tool metadata file kept in the stash config directory.
pub const CREDENTIAL_FILE: &str = "encfs6.xml";

/// Optional gpg-encrypted passphrase kept next to the credential file.
pub const PASSPHRASE_FILE: &str = "encfs.pass.gpg";

/// How registry construction treats a section that fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistryPolicy {
    /// Abort construction with the first error.
    #[default]
    FailFast,
    /// Log a warning and leave the stash out.
    SkipInvalid,
}

/// A named encrypted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stash {
    /// Unique identifier, also the mount point and vault basename.
    pub name: String,
    /// Directory holding credentials and watcher state.
    pub config_path: PathBuf,
    /// Encryption-tool metadata; guaranteed to exist at build time.
    pub credential_file: PathBuf,
    /// gpg-encrypted passphrase, if one was saved.
    pub passphrase_file: Option<PathBuf>,
    /// Ciphertext directory; guaranteed to exist at build time.
    pub vault_root: PathBuf,
    /// Sync target. `None` when absent or when sync is disabled.
    pub remote_path: Option<String>,
    /// Set while mounted content changed since the last successful push.
    pub dirty: bool,
}

impl Stash {
    /// Returns true if pull/push are allowed for this stash.
    pub fn sync_enabled(&self) -> bool {
        self.remote_path.is_some()
    }

    /// Mount point under the given global mount root.
    pub fn mount_point(&self, mount_root: &Path) -> PathBuf {
        mount_root.join(&self.name)
    }

    /// Path of the per-stash lock file.
    pub fn lock_file(&self) -> PathBuf {
        self.config_path.join(".lock")
    }

    /// Builds a stash from its configuration section.
    ///
    /// `base_dir` is where per-stash config directories default to.
    pub fn from_config(config: &Config, name: &str, base_dir: &Path) -> Result<Self> {
        let section = config.section(name).ok_or_else(|| Error::NotAStash {
            name: name.to_string(),
        })?;

        let config_path = match section.get(keys::CONFIG_PATH) {
            Some(path) => config::expand_tilde(path),
            None => base_dir.join(name),
        };
        config::check_dir(&config_path)?;

        let credential_file = config_path.join(CREDENTIAL_FILE);
        if !credential_file.is_file() {
            return Err(Error::FileNotFound {
                path: credential_file,
            });
        }
        restrict_to_owner(&credential_file)?;

        let passphrase_file = Some(config_path.join(PASSPHRASE_FILE)).filter(|p| p.is_file());
        if let Some(file) = &passphrase_file {
            restrict_to_owner(file)?;
        }

        let vault_root = match section.get(keys::ENCFS_ROOT) {
            Some(path) => config::expand_tilde(path),
            None => config
                .vault_root()
                .ok_or(Error::HomeDirNotFound)?
                .join(name),
        };
        if !vault_root.is_dir() {
            return Err(Error::FileNotFound { path: vault_root });
        }

        let remote_path = if section.flag(keys::NOSYNC) {
            None
        } else {
            section
                .get(keys::REMOTE_PATH)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            name: name.to_string(),
            config_path,
            credential_file,
            passphrase_file,
            vault_root,
            remote_path,
            dirty: section.get(keys::LAST_CHANGE).is_some(),
        })
    }
}

/// In-memory catalog of stashes keyed by name.
#[derive(Debug, Clone, Default)]
pub struct StashRegistry {
    stashes: BTreeMap<String, Stash>,
}

impl StashRegistry {
    /// Builds one entry per non-`general` section.
    pub fn build(config: &Config, base_dir: &Path, policy: RegistryPolicy) -> Result<Self> {
        let mut stashes = BTreeMap::new();

        for name in config.stash_names() {
            match Stash::from_config(config, name, base_dir) {
                Ok(stash) => {
                    debug!("registered stash {}", name);
                    stashes.insert(name.to_string(), stash);
                }
                Err(e) if policy == RegistryPolicy::SkipInvalid => {
                    warn!("skipping stash {}: {}", name, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self { stashes })
    }

    /// Looks a stash up, failing with `NotAStash`.
    pub fn get(&self, name: &str) -> Result<&Stash> {
        self.stashes.get(name).ok_or_else(|| Error::NotAStash {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stashes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stashes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stash> {
        self.stashes.values()
    }

    pub fn len(&self) -> usize {
        self.stashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stashes.is_empty()
    }
}

/// Validates a name for use as a section and directory name.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != GENERAL
        && name != "all"
        && !name.starts_with('.')
        && !name.contains(['/', '[', ']', '\n']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidStashName {
            name: name.to_string(),
        })
    }
}

/// Tightens a file to owner read/write only.
#[cfg(unix)]
pub fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path).permissions_context(path)?.permissions();
    if perms.mode() & 0o777 != 0o600 {
        perms.set_mode(0o600);
        fs::set_permissions(path, perms).permissions_context(path)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

/// Human-readable size of a vault root as reported by `du -sh`.
///
/// Returns `None` when the tool fails or prints nothing.
pub fn disk_usage(executor: &dyn Executor, vault_root: &Path) -> Option<String> {
    let inv = Invocation::new("du").args(["-sh".to_string(), vault_root.display().to_string()]);
    match executor.run(&inv) {
        Ok(output) if output.success() => String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .next()
            .map(str::to_string),
        Ok(output) => {
            debug!("du failed on {}: {}", vault_root.display(), output.stderr_lossy());
            None
        }
        Err(e) => {
            debug!("du failed on {}: {}", vault_root.display(), e);
            None
        }
    }
}
