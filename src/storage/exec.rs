//! storage::exec
//!
//! External command execution.
//!
//! # Architecture
//!
//! [`CommandExecutor`] is the seam between the storage adapter and the
//! operating system. [`ProcessExecutor`] runs real processes; tests swap in
//! a scripted executor so parsing can be checked against canned output.
//!
//! Arguments can be marked secret with [`CommandLine::secret_arg`]. Secret
//! arguments are passed to the process unchanged but render as `*****` in
//! logs and in [`CommandError`] messages.
//!
//! # Example
//!
//! ```
//! use stratum::storage::exec::CommandLine;
//!
//! let cmd = CommandLine::new("zfs")
//!     .arg("set")
//!     .secret_arg("io.stratum:remotes=[{\"password\":\"hunter2\"}]")
//!     .arg("tank/repo/foo");
//! assert_eq!(cmd.to_string(), "zfs set ***** tank/repo/foo");
//! ```

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error};

/// Placeholder printed for secret arguments.
pub const REDACTED: &str = "*****";

/// A failed external command.
///
/// `output` holds whatever the command wrote to stderr (or stdout when
/// stderr was empty). The storage engine inspects it for well-known
/// substrings; everything else is surfaced unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("command '{command}' failed: {output}")]
pub struct CommandError {
    /// Redacted command line.
    pub command: String,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Diagnostic output.
    pub output: String,
}

impl CommandError {
    pub fn new(
        command: impl Into<String>,
        exit_code: Option<i32>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// Whether the output reports a missing object.
    pub fn is_does_not_exist(&self) -> bool {
        self.output.contains("does not exist")
    }

    /// Whether the output reports a duplicate object.
    pub fn is_already_exists(&self) -> bool {
        self.output.contains("already exists")
    }

    /// Whether the output reports clones still depending on the object.
    pub fn is_dependent_clones(&self) -> bool {
        self.output.contains("dependent clones")
    }
}

/// A command line with optional secret arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    args: Vec<(String, bool)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            args: vec![(program.into(), false)],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push((arg.into(), false));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|a| (a.into(), false)));
        self
    }

    /// Append an argument that must not appear in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push((arg.into(), true));
        self
    }

    pub fn program(&self) -> &str {
        self.args.first().map(|(a, _)| a.as_str()).unwrap_or_default()
    }

    /// Raw argv, secrets included.
    pub fn argv(&self) -> Vec<&str> {
        self.args.iter().map(|(a, _)| a.as_str()).collect()
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<&str> = self
            .args
            .iter()
            .map(|(a, secret)| if *secret { REDACTED } else { a.as_str() })
            .collect();
        write!(f, "{}", rendered.join(" "))
    }
}

/// Runs external commands.
pub trait CommandExecutor: Send + Sync + std::fmt::Debug {
    /// Run `cmd` to completion and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the process cannot be started, exits
    /// non-zero or exceeds the executor's timeout.
    fn exec(&self, cmd: &CommandLine) -> Result<String, CommandError>;
}

/// Executor backed by `std::process`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_string(&mut buf);
        }
        buf
    })
}

impl CommandExecutor for ProcessExecutor {
    fn exec(&self, cmd: &CommandLine) -> Result<String, CommandError> {
        let shown = cmd.to_string();
        let argv = cmd.argv();
        let fail = |code: Option<i32>, output: String| {
            error!(command = %shown, exit_code = ?code, %output, "command failed");
            CommandError::new(shown.clone(), code, output)
        };

        let mut child = Command::new(cmd.program())
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(None, format!("failed to start: {e}")))?;

        // Drain both pipes so a chatty command cannot block on a full buffer.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(fail(None, e.to_string())),
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(fail(None, format!("timed out after {}s", timeout.as_secs())));
                }
            }
            thread::sleep(Duration::from_millis(10));
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if status.success() {
            debug!(command = %shown, "command succeeded");
            Ok(stdout)
        } else {
            let output = if stderr.trim().is_empty() { stdout } else { stderr };
            Err(fail(status.code(), output.trim_end().to_string()))
        }
    }
}
