//! Configuration file parsing and writing module.
//!
//! The configuration is an INI-style file with a `general` section and one
//! section per stash. Every operation works on an immutable [`Config`]
//! snapshot and persists changes through an explicit [`ConfigStore::save`],
//! which rewrites the whole file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::stash::RegistryPolicy;

/// Name of the global section.
pub const GENERAL: &str = "general";

/// Application directory under the platform config dir.
pub const APP_DIR: &str = "stashctl";

/// Default config file name.
pub const CONFIG_FILE: &str = "stashctl.conf";

/// Keys of the `general` section.
pub mod keys {
    pub const MOUNT_ROOT: &str = "mount_root";
    pub const VAULT_ROOT: &str = "vault_root";
    pub const ON_INVALID_STASH: &str = "on_invalid_stash";

    pub const CONFIG_PATH: &str = "config_path";
    pub const REMOTE_PATH: &str = "remote_path";
    pub const ENCFS_ROOT: &str = "encfs_root";
    pub const NOSYNC: &str = "nosync";
    pub const LAST_MOUNT: &str = "last_mount";
    pub const LAST_UNMOUNT: &str = "last_unmount";
    pub const LAST_CHANGE: &str = "last_change";
    pub const LAST_PUSH: &str = "last_push";
}

/// A single `[name]` block with its ordered key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    /// Creates an empty section.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a key, keeping its original position when it already exists.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Interprets a key as a boolean flag (`true`, `yes`, `on`, `1`).
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "true" | "yes" | "on" | "1"
            )
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parsed configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    sections: Vec<Section>,
}

impl Config {
    /// Parses INI content.
    ///
    /// Blank lines and lines starting with `#` or `;` are ignored. Keys are
    /// lowercased; `=` and `:` are both accepted as separators.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Config::default();
        let mut current: Option<usize> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            let line_no = idx + 1;

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| Error::ConfigParse {
                    line: line_no,
                    message: format!("unterminated section header '{}'", line),
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::ConfigParse {
                        line: line_no,
                        message: "empty section name".to_string(),
                    });
                }
                current = Some(config.section_index(name));
                continue;
            }

            let Some(section) = current else {
                return Err(Error::ConfigParse {
                    line: line_no,
                    message: format!("'{}' appears before any section header", line),
                });
            };

            let split_at = line.find(['=', ':']).ok_or_else(|| Error::ConfigParse {
                line: line_no,
                message: format!("expected 'key = value', got '{}'", line),
            })?;
            let key = line[..split_at].trim().to_lowercase();
            let value = line[split_at + 1..].trim();
            if key.is_empty() {
                return Err(Error::ConfigParse {
                    line: line_no,
                    message: "empty key".to_string(),
                });
            }
            config.sections[section].set(&key, value);
        }

        Ok(config)
    }

    /// Formats the configuration back to INI text.
    pub fn to_ini_string(&self) -> String {
        let mut output = String::new();
        for section in &self.sections {
            output.push('[');
            output.push_str(&section.name);
            output.push_str("]\n");
            for (key, value) in section.entries() {
                output.push_str(key);
                output.push_str(" = ");
                output.push_str(value);
                output.push('\n');
            }
            output.push('\n');
        }
        output
    }

    fn section_index(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return idx;
        }
        self.sections.push(Section::new(name));
        self.sections.len() - 1
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Returns the named section, creating it when absent.
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let idx = self.section_index(name);
        &mut self.sections[idx]
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.section_mut(section).set(key, value);
    }

    pub fn remove(&mut self, section: &str, key: &str) -> Option<String> {
        self.sections
            .iter_mut()
            .find(|s| s.name == section)
            .and_then(|s| s.remove(key))
    }

    /// Returns a copy with one key changed.
    pub fn with(&self, section: &str, key: &str, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.set(section, key, value);
        next
    }

    /// Names of every non-`general` section, in file order.
    pub fn stash_names(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| *name != GENERAL)
    }

    /// Effective mount root. Only meaningful after [`Config::ensure_defaults`].
    pub fn mount_root(&self) -> Option<PathBuf> {
        self.get(GENERAL, keys::MOUNT_ROOT).map(expand_tilde)
    }

    /// Effective vault root. Only meaningful after [`Config::ensure_defaults`].
    pub fn vault_root(&self) -> Option<PathBuf> {
        self.get(GENERAL, keys::VAULT_ROOT).map(expand_tilde)
    }

    /// Registry policy requested by `general.on_invalid_stash`.
    pub fn registry_policy(&self) -> RegistryPolicy {
        match self.get(GENERAL, keys::ON_INVALID_STASH) {
            Some(v) if v.eq_ignore_ascii_case("skip") => RegistryPolicy::SkipInvalid,
            _ => RegistryPolicy::FailFast,
        }
    }

    /// Fills `mount_root` and `vault_root` with home-relative defaults and
    /// makes sure both directories exist.
    pub fn ensure_defaults(self) -> Result<Self> {
        let home = dirs::home_dir().ok_or(Error::HomeDirNotFound)?;
        self.ensure_defaults_in(&home)
    }

    /// Same as [`Config::ensure_defaults`] with an explicit home directory.
    pub fn ensure_defaults_in(mut self, home: &Path) -> Result<Self> {
        let general = self.section_mut(GENERAL);
        if general.get(keys::MOUNT_ROOT).is_none() {
            general.set(keys::MOUNT_ROOT, home.join("Private").display().to_string());
        }
        if general.get(keys::VAULT_ROOT).is_none() {
            general.set(
                keys::VAULT_ROOT,
                home.join(".encfs_root").display().to_string(),
            );
        }

        for key in [keys::MOUNT_ROOT, keys::VAULT_ROOT] {
            if let Some(path) = self.get(GENERAL, key).map(expand_tilde)
                && check_dir(&path)?
            {
                warn!("{} did not exist and has been created", path.display());
            }
        }

        Ok(self)
    }
}

/// Loads and persists [`Config`] snapshots at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location: `<config dir>/stashctl/stashctl.conf`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .ok_or(Error::HomeDirNotFound)?;
        Ok(base.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory under which per-stash config directories default.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Reads the file. A missing file yields an empty configuration.
    pub fn load(&self) -> Result<Config> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Config::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e).config_read_context(&self.path),
        }
    }

    /// Rewrites the whole file from the snapshot.
    ///
    /// The content goes to a temporary file in the same directory which then
    /// replaces the config, so readers see either the old or the new file.
    pub fn save(&self, config: &Config) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                check_dir(parent)?;
                parent.to_path_buf()
            }
            _ => PathBuf::from("."),
        };

        let mut tmp = NamedTempFile::new_in(&dir).config_write_context(&self.path)?;
        tmp.write_all(config.to_ini_string().as_bytes())
            .config_write_context(&self.path)?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .config_write_context(&self.path)?;
        Ok(())
    }

    /// Reloads the file, applies `change` and saves the result.
    ///
    /// Last writer wins; there is no locking against concurrent writers.
    pub fn update(&self, change: impl FnOnce(&mut Config)) -> Result<Config> {
        let mut config = self.load()?;
        change(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

/// Ensures `path` is a directory, creating it when absent.
///
/// Returns `true` when the directory had to be created.
pub fn check_dir(path: &Path) -> Result<bool> {
    if path.exists() {
        if !path.is_dir() {
            return Err(Error::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        return Ok(false);
    }
    fs::create_dir_all(path).dir_context(path)?;
    Ok(true)
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde(value: &str) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if value == "~" {
            return home;
        }
        if let Some(rest) = value.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}

/// Current unix time in seconds.
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
