//! Mount operations module.
//!
//! This module reads the live mount table to classify stashes as mounted or
//! unmounted, prepares mount point directories, and builds the encryption
//! tool and unmount tool invocations.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::executor::{Input, Invocation, OutputMode};
use crate::stash::Stash;

/// Live mount table on Linux.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Device name the encryption tool registers its mounts under.
pub const ENCFS_DEVICE: &str = "encfs";

/// Filesystem type of encryption tool mounts.
pub const ENCFS_FSTYPE: &str = "fuse.encfs";

/// Environment variable pointing the encryption tool at the credential file.
pub const ENCFS_CONFIG_ENV: &str = "ENCFS6_CONFIG";

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Source device (e.g., "encfs").
    pub source: String,
    /// Mount point path.
    pub target: PathBuf,
    /// Filesystem type (e.g., "fuse.encfs").
    pub fstype: String,
}

impl MountEntry {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<PathBuf>,
        fstype: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
        }
    }

    /// Parses a single `/proc/mounts` line.
    ///
    /// Format: `{device} {mountpoint} {fstype} {options} {dump} {pass}`.
    /// Returns None for lines with fewer than three fields.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let source = parts.next()?;
        let target = parts.next()?;
        let fstype = parts.next()?;

        Some(Self {
            source: unescape_mount_path(source),
            target: PathBuf::from(unescape_mount_path(target)),
            fstype: fstype.to_string(),
        })
    }

    /// Returns true if this entry is an encryption tool mount.
    pub fn is_encfs(&self) -> bool {
        self.source == ENCFS_DEVICE && self.fstype == ENCFS_FSTYPE
    }
}

/// Source of the live mount table.
///
/// Implementations must query the OS on every call; nothing is cached.
pub trait MountSource: Send + Sync {
    fn mounts(&self) -> Result<Vec<MountEntry>>;
}

/// Reads `/proc/mounts` (or another file in the same format).
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self {
            path: PathBuf::from(PROC_MOUNTS),
        }
    }
}

impl ProcMounts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MountSource for ProcMounts {
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        let content = fs::read_to_string(&self.path).file_context(&self.path)?;
        Ok(parse_mount_table(&content))
    }
}

/// Parses the whole mount table.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(MountEntry::from_line).collect()
}

/// Names of known stashes currently mounted at `mount_root/<name>`.
pub fn mounted_stashes<'a, I>(
    source: &dyn MountSource,
    names: I,
    mount_root: &Path,
) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let known: BTreeSet<&str> = names.into_iter().collect();
    let mounted = source
        .mounts()?
        .into_iter()
        .filter(MountEntry::is_encfs)
        .filter(|entry| entry.target.parent() == Some(mount_root))
        .filter_map(|entry| {
            entry
                .target
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| known.contains(n))
                .map(str::to_string)
        })
        .collect();

    Ok(mounted)
}

/// Known stash names minus the mounted ones.
pub fn unmounted_stashes<'a, I>(
    source: &dyn MountSource,
    names: I,
    mount_root: &Path,
) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    let mounted = mounted_stashes(source, names.clone(), mount_root)?;
    Ok(names
        .into_iter()
        .filter(|n| !mounted.contains(*n))
        .map(str::to_string)
        .collect())
}

/// Checks that `path` can serve as a mount target: absent, or an empty
/// directory. When `create` is set an absent directory is created.
pub fn prepare_empty_dir(path: &Path, create: bool) -> Result<()> {
    if !path.exists() {
        if create {
            fs::create_dir_all(path).dir_context(path)?;
        }
        return Ok(());
    }
    if !path.is_dir() {
        return Err(Error::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    let mut entries = fs::read_dir(path).file_context(path)?;
    if entries.next().is_some() {
        return Err(Error::NotEmptyDirectory {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// How the encryption tool obtains the passphrase.
#[derive(Clone)]
pub enum PassphraseSource {
    /// Decrypted passphrase fed on stdin.
    Stdin(Vec<u8>),
    /// Command the tool runs to print the passphrase.
    Command(String),
    /// The tool prompts on the terminal.
    Prompt,
}

impl std::fmt::Debug for PassphraseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassphraseSource::Stdin(_) => f.write_str("Stdin(<redacted>)"),
            PassphraseSource::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            PassphraseSource::Prompt => f.write_str("Prompt"),
        }
    }
}

/// Builds the encryption tool invocation mounting `stash` at `mount_point`.
pub fn encfs_mount(stash: &Stash, mount_point: &Path, source: PassphraseSource) -> Invocation {
    let vault = stash.vault_root.display().to_string();
    let target = mount_point.display().to_string();
    let inv = Invocation::new("encfs").env(
        ENCFS_CONFIG_ENV,
        stash.credential_file.display().to_string(),
    );

    match source {
        PassphraseSource::Stdin(pass) => inv
            .args(["-S".to_string(), vault, target])
            .input(Input::Bytes(pass)),
        PassphraseSource::Command(cmd) => inv.args([format!("--extpass={}", cmd), vault, target]),
        PassphraseSource::Prompt => inv
            .args([vault, target])
            .input(Input::Inherit)
            .output(OutputMode::Passthrough),
    }
}

/// Builds the encryption tool invocation initializing a new vault.
pub fn encfs_create(root_dir: &Path, mount_point: &Path) -> Invocation {
    Invocation::new("encfs")
        .args([
            "--standard".to_string(),
            root_dir.display().to_string(),
            mount_point.display().to_string(),
        ])
        .input(Input::Inherit)
        .output(OutputMode::Passthrough)
}

/// Builds the unmount tool invocation.
pub fn fusermount_unmount(mount_point: &Path) -> Invocation {
    Invocation::new("fusermount")
        .arg("-u")
        .arg(mount_point.display().to_string())
}

/// Unescapes octal sequences in mount table fields.
///
/// Handles space (\040), tab (\011), newline (\012), and backslash (\134).
fn unescape_mount_path(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let octal: String = chars.clone().take(3).collect();
            if octal.len() == 3
                && octal.chars().all(|d| ('0'..='7').contains(&d))
                && let Ok(byte) = u8::from_str_radix(&octal, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}
