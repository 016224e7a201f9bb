//! External tool execution abstraction.
//!
//! Every subprocess the core needs (encryption tool, unmount tool, sync tool,
//! credential tool, process lookups) is described as an [`Invocation`] and run
//! through an [`Executor`]. Only the exit code and the captured bytes ever
//! reach the lifecycle logic.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

/// Where the child's standard input comes from.
#[derive(Clone, Default)]
pub enum Input {
    /// Share the caller's terminal (interactive prompts).
    Inherit,
    /// Read nothing.
    #[default]
    Null,
    /// Feed these bytes, then close.
    Bytes(Vec<u8>),
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Inherit => f.write_str("Inherit"),
            Input::Null => f.write_str("Null"),
            // May carry a passphrase.
            Input::Bytes(bytes) => write!(f, "Bytes(<{} bytes>)", bytes.len()),
        }
    }
}

/// What happens to the child's standard output and error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Collect both streams.
    #[default]
    Capture,
    /// Stream to the caller's terminal.
    Passthrough,
}

/// A single external command.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub input: Input,
    pub output: OutputMode,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn input(mut self, input: Input) -> Self {
        self.input = input;
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Human-readable command line, used in logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `-1` when terminated by a signal.
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs external tools.
pub trait Executor: Send + Sync {
    /// Runs the invocation to completion.
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;

    /// Starts the invocation in its own process group without waiting.
    ///
    /// Returns the child's pid.
    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32>;
}

/// Runs an invocation and turns a non-zero exit into `SubcommandFailed`.
pub fn run_checked(executor: &dyn Executor, invocation: &Invocation) -> Result<ToolOutput> {
    let output = executor.run(invocation)?;
    if !output.success() {
        return Err(Error::SubcommandFailed {
            command: invocation.command_line(),
            code: output.code,
            stderr: output.stderr_lossy(),
        });
    }
    Ok(output)
}

/// Executor backed by real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl Executor for SystemExecutor {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        let command_line = invocation.command_line();
        debug!("running {}", command_line);

        let mut cmd = Self::command(invocation);
        cmd.stdin(match invocation.input {
            Input::Inherit => Stdio::inherit(),
            Input::Null => Stdio::null(),
            Input::Bytes(_) => Stdio::piped(),
        });
        match invocation.output {
            OutputMode::Capture => cmd.stdout(Stdio::piped()).stderr(Stdio::piped()),
            OutputMode::Passthrough => cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit()),
        };

        let mut child = cmd.spawn().command_context(&command_line)?;

        if let Input::Bytes(bytes) = &invocation.input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(bytes).command_context(&command_line)?;
            // stdin is dropped here so the child sees EOF
        }

        let output = child.wait_with_output().command_context(&command_line)?;

        Ok(ToolOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn spawn_detached(&self, invocation: &Invocation) -> Result<u32> {
        let command_line = invocation.command_line();
        debug!("spawning {}", command_line);

        let mut cmd = Self::command(invocation);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().command_context(&command_line)?;
        Ok(child.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let inv = Invocation::new("rsync").args(["-av", "--delete", "a/", "b/"]);
        assert_eq!(inv.command_line(), "rsync -av --delete a/ b/");
    }

    #[test]
    fn test_input_debug_hides_bytes() {
        let inv = Invocation::new("encfs").input(Input::Bytes(b"hunter2".to_vec()));
        let shown = format!("{:?}", inv);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("<7 bytes>"));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_captures_output() {
        let inv = Invocation::new("sh")
            .args(["-c", "cat; echo oops >&2; exit 3"])
            .input(Input::Bytes(b"hello".to_vec()));
        let output = SystemExecutor.run(&inv).unwrap();

        assert_eq!(output.code, 3);
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.stderr_lossy(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_checked_maps_exit_code() {
        let err = run_checked(&SystemExecutor, &Invocation::new("false")).unwrap_err();
        assert!(matches!(err, Error::SubcommandFailed { code: 1, .. }));
    }

    #[test]
    fn test_missing_program() {
        let err = SystemExecutor
            .run(&Invocation::new("definitely-not-a-real-program-xyz"))
            .unwrap_err();
        assert!(matches!(err, Error::CommandExecution { .. }));
    }
}
