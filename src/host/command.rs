//! Pre/post hook command execution.

use crate::config::Params;
use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Prefix of the environment variables parameters are exported as.
pub const PARAM_ENV_PREFIX: &str = "KVM_TEST_";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A hook command configured through `<prefix>_command` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct HookCommand {
    /// Shell command line.
    pub command: String,
    /// Time allowed for the command.
    pub timeout: Duration,
    /// Whether failures are only logged.
    pub noncritical: bool,
}

impl HookCommand {
    /// Read `<prefix>_command`, `<prefix>_command_timeout` (default 600 s)
    /// and `<prefix>_command_noncritical`.
    ///
    /// Returns `None` when no command is configured.
    pub fn from_params(params: &Params, prefix: &str) -> Result<Option<Self>> {
        let Some(command) = params.get(&format!("{}_command", prefix)).filter(|c| !c.is_empty())
        else {
            return Ok(None);
        };
        Ok(Some(Self {
            command: command.to_string(),
            timeout: params.get_secs(&format!("{}_command_timeout", prefix), 600.0)?,
            noncritical: params.is_yes(&format!("{}_command_noncritical", prefix)),
        }))
    }

    /// Run the command in `workdir` with every parameter exported.
    ///
    /// Failures of a noncritical command are logged and swallowed.
    pub fn run(&self, params: &Params, workdir: &Path) -> Result<()> {
        match run_hook(params, workdir, &self.command, self.timeout) {
            Err(e) if self.noncritical => {
                tracing::warn!(command = %self.command, error = %e, "noncritical command failed");
                Ok(())
            }
            result => result,
        }
    }
}

/// Run `command` through `sh -c` in `workdir`.
///
/// Every parameter is exported to the child as `KVM_TEST_<key>`. The child is
/// killed when it outlives `timeout`.
pub fn run_hook(params: &Params, workdir: &Path, command: &str, timeout: Duration) -> Result<()> {
    let script = format!("cd {}; {}", shell_quote(&workdir.to_string_lossy()), command);
    tracing::info!(command, workdir = %workdir.display(), "running hook command");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&script)
        .envs(
            params
                .iter()
                .map(|(key, value)| (format!("{}{}", PARAM_ENV_PREFIX, key), value)),
        )
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| Error::command_failed(command, e.to_string()))?;

    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            return Err(Error::command_failed(command, status.to_string()));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout(format!(
                "command '{}' did not finish within {:?}",
                command, timeout
            )));
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
