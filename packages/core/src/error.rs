//! Unified error types for the stashctl-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The name does not match any registered stash.
    #[snafu(display("{name} is not a known stash"))]
    NotAStash { name: String },

    /// Illegal mount/unmount transition.
    #[snafu(display("{name}: {message}"))]
    Mount { name: String, message: String },

    /// Synchronization attempted without a configured remote.
    #[snafu(display("no remote configured for {name}"))]
    NoRemoteConfigured { name: String },

    /// Pull attempted while local changes have not been pushed.
    #[snafu(display("{name} has unpushed local changes, push it first"))]
    MustBePushed { name: String },

    /// Target directory exists but is not empty.
    #[snafu(display("{} is not an empty directory", path.display()))]
    NotEmptyDirectory { path: PathBuf },

    /// A configured path exists but is not a directory.
    #[snafu(display("{} already exists but is not a directory", path.display()))]
    NotADirectory { path: PathBuf },

    /// A stash prerequisite is missing on disk.
    #[snafu(display("{} does not exist", path.display()))]
    FileNotFound { path: PathBuf },

    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    SubcommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Configuration file cannot be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file cannot be written.
    #[snafu(display("failed to write config at {}", path.display()))]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed configuration line.
    #[snafu(display("failed to parse config line {line}: {message}"))]
    ConfigParse { line: usize, message: String },

    /// Directory creation failed.
    #[snafu(display("failed to create directory at {}", path.display()))]
    DirectoryCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Moving or inspecting a file failed.
    #[snafu(display("file operation failed on {}", path.display()))]
    FileOperation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Tightening file permissions failed.
    #[snafu(display("failed to set permissions on {}", path.display()))]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Home directory not found.
    #[snafu(display("Could not determine home directory"))]
    HomeDirNotFound,

    /// Creating a stash whose name is already registered.
    #[snafu(display("a stash named {name} already exists"))]
    StashExists { name: String },

    /// The name cannot be used as a stash identifier.
    #[snafu(display("invalid stash name '{name}'"))]
    InvalidStashName { name: String },

    /// The change-notification facility refused a watch.
    #[snafu(display("failed to watch {}", path.display()))]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },

    /// A watcher is already active for the stash.
    #[snafu(display("{name} is already watched"))]
    WatchActive { name: String },

    /// Lease record could not be read or written.
    #[snafu(display("watch lease error at {}: {message}", path.display()))]
    Lease { path: PathBuf, message: String },

    /// Per-stash lock could not be taken.
    #[snafu(display("failed to lock {}: {message}", path.display()))]
    Lock { path: PathBuf, message: String },

    /// Interactive passphrase entry failed.
    #[snafu(display("passphrase entry failed: {message}"))]
    Passphrase { message: String },
}

impl Error {
    /// Builds a `Mount` error for the given stash.
    pub fn mount(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mount {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config write errors.
    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for directory creation errors.
    fn dir_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for generic file operations.
    fn file_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for permission changes.
    fn permissions_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigWriteSnafu { path: path.into() })
    }

    fn dir_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(DirectoryCreationSnafu { path: path.into() })
    }

    fn file_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(FileOperationSnafu { path: path.into() })
    }

    fn permissions_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(PermissionsSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::NotAStash {
            name: "vault1".to_string(),
        };
        assert_eq!(err.to_string(), "vault1 is not a known stash");

        let err = Error::mount("vault1", "already mounted");
        assert_eq!(err.to_string(), "vault1: already mounted");

        let err = Error::SubcommandFailed {
            command: "rsync".to_string(),
            code: 23,
            stderr: "partial transfer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command 'rsync' exited with code 23: partial transfer"
        );
    }

    #[test]
    fn test_io_context() {
        let io: std::io::Result<()> = Err(std::io::Error::other("boom"));
        let err = io.config_read_context("/tmp/x.conf").unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
