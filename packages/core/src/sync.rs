//! File-sync tool integration.
//!
//! Pull and push mirror a stash's vault root and its remote with
//! delete-extraneous semantics: the destination ends up matching the source.

use std::path::Path;

use crate::executor::{Executor, Invocation, OutputMode};

/// Sync tool binary.
pub const SYNC_TOOL: &str = "rsync";

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// remote -> vault root
    Pull,
    /// vault root -> remote
    Push,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

/// Appends a trailing slash so the tool copies directory contents.
fn as_dir_arg(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Builds the sync tool invocation for one direction.
pub fn rsync(
    vault_root: &Path,
    remote: &str,
    direction: Direction,
    output: OutputMode,
) -> Invocation {
    let local = as_dir_arg(&vault_root.display().to_string());
    let remote = as_dir_arg(remote);
    let (src, dst) = match direction {
        Direction::Pull => (remote, local),
        Direction::Push => (local, remote),
    };

    Invocation::new(SYNC_TOOL)
        .args(["-av".to_string(), "--delete".to_string(), src, dst])
        .output(output)
}

/// Checks if a sync tool process owned by the current user is running.
///
/// This is an approximation of "a sync is in flight", not a lock.
pub fn is_sync_running(executor: &dyn Executor) -> bool {
    let uid = nix::unistd::getuid().as_raw().to_string();
    executor
        .run(&Invocation::new("pgrep").args(["-u", uid.as_str(), "-x", SYNC_TOOL]))
        .map(|o| o.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ToolOutput;
    use crate::testing::FakeExecutor;

    #[test]
    fn test_pull_mirrors_remote_into_vault() {
        let inv = rsync(
            Path::new("/home/me/.encfs_root/vault1"),
            "backup:/srv/vault1",
            Direction::Pull,
            OutputMode::Capture,
        );
        assert_eq!(
            inv.command_line(),
            "rsync -av --delete backup:/srv/vault1/ /home/me/.encfs_root/vault1/"
        );
    }

    #[test]
    fn test_push_mirrors_vault_to_remote() {
        let inv = rsync(
            Path::new("/home/me/.encfs_root/vault1/"),
            "backup:/srv/vault1/",
            Direction::Push,
            OutputMode::Passthrough,
        );
        assert_eq!(
            inv.command_line(),
            "rsync -av --delete /home/me/.encfs_root/vault1/ backup:/srv/vault1/"
        );
        assert_eq!(inv.output, OutputMode::Passthrough);
    }

    #[test]
    fn test_is_sync_running() {
        let executor = FakeExecutor::new();
        executor.respond("pgrep", ToolOutput::default());
        assert!(is_sync_running(&executor));

        executor.respond(
            "pgrep",
            ToolOutput {
                code: 1,
                ..ToolOutput::default()
            },
        );
        assert!(!is_sync_running(&executor));
    }
}
