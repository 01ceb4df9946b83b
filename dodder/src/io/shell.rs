//! Shell abstraction: resolve the host shell and run one command string in it.
//!
//! The [`Shell`] trait decouples the loop controller from process spawning.
//! Tests use recording shells that return predetermined results.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::ExecutionResult;
use crate::error::ShellError;
use crate::io::process::{Interrupted, run_command};

pub const POSIX_DEFAULT_SHELL: &str = "/bin/sh";
pub const WINDOWS_DEFAULT_COMSPEC: &str = "C:\\Windows\\System32\\cmd.exe";

/// Abstraction over command execution backends.
pub trait Shell {
    /// Run `command` in `cwd`.
    ///
    /// Fails only when `cwd` is not an existing directory; spawn failures,
    /// non-zero exits, timeouts and cancellation are reported in the result.
    fn execute(&self, command: &str, cwd: &Path) -> Result<ExecutionResult, ShellError>;
}

/// Command-line convention of a shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlavor {
    /// `<shell> -c <command>`
    Posix,
    /// `powershell.exe -NoProfile -Command <command>`
    PowerShell,
    /// `cmd.exe /C <command>`
    Cmd,
}

/// A resolved shell executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInfo {
    pub name: String,
    pub program: PathBuf,
    pub flavor: ShellFlavor,
}

impl fmt::Display for ShellInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.program.display())
    }
}

impl ShellInfo {
    /// Resolve the shell for the current host from the process environment.
    pub fn detect() -> Self {
        Self::resolve(cfg!(windows), |key| std::env::var(key).ok())
    }

    /// Resolve a shell for a POSIX or Windows host from an environment lookup.
    ///
    /// - Windows: PowerShell when `PSModulePath` is set, else `%COMSPEC%`, else `cmd.exe`.
    /// - POSIX: `$SHELL`, else `/bin/sh`.
    pub fn resolve<F: Fn(&str) -> Option<String>>(windows: bool, env: F) -> Self {
        let lookup = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        if windows {
            if lookup("PSModulePath").is_some() {
                return Self {
                    name: "powershell".to_string(),
                    program: PathBuf::from("powershell.exe"),
                    flavor: ShellFlavor::PowerShell,
                };
            }
            let comspec = lookup("COMSPEC").unwrap_or_else(|| WINDOWS_DEFAULT_COMSPEC.to_string());
            return Self {
                name: "cmd".to_string(),
                program: PathBuf::from(comspec),
                flavor: ShellFlavor::Cmd,
            };
        }

        let program = lookup("SHELL").unwrap_or_else(|| POSIX_DEFAULT_SHELL.to_string());
        let name = program
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("sh")
            .to_string();
        Self {
            name,
            program: PathBuf::from(program),
            flavor: ShellFlavor::Posix,
        }
    }

    /// Build the process invocation for `command`.
    pub fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        match self.flavor {
            ShellFlavor::Posix => {
                cmd.arg("-c").arg(command);
            }
            ShellFlavor::PowerShell => {
                cmd.arg("-NoProfile").arg("-Command").arg(command);
            }
            ShellFlavor::Cmd => {
                cmd.arg("/C").arg(command);
            }
        }
        cmd
    }
}

/// Shell that spawns real processes through the host's shell.
#[derive(Debug, Clone)]
pub struct HostShell {
    info: ShellInfo,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl HostShell {
    pub fn new(
        info: ShellInfo,
        timeout: Option<Duration>,
        output_limit_bytes: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            info,
            timeout,
            output_limit_bytes,
            cancel,
        }
    }

    pub fn info(&self) -> &ShellInfo {
        &self.info
    }
}

impl Shell for HostShell {
    #[instrument(skip_all, fields(shell = %self.info.name, cwd = %cwd.display()))]
    fn execute(&self, command: &str, cwd: &Path) -> Result<ExecutionResult, ShellError> {
        if !cwd.is_dir() {
            warn!("working directory missing, not spawning");
            return Err(ShellError::InvalidWorkingDirectory(cwd.to_path_buf()));
        }

        info!(command, "running command");
        let mut cmd = self.info.command(command);
        cmd.current_dir(cwd);

        let output = match run_command(cmd, self.timeout, self.output_limit_bytes, &self.cancel) {
            Ok(output) => output,
            Err(err) => {
                return Ok(ExecutionResult {
                    success: false,
                    error: Some(format!("{err:#}")),
                    ..ExecutionResult::default()
                });
            }
        };

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        stdout.push_str(&output.stdout_truncated_notice());
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        stderr.push_str(&output.stderr_truncated_notice());

        let exit_code = output.status.and_then(|status| status.code());
        let exited_ok = output.status.is_some_and(|status| status.success());
        let timed_out = output.interrupted == Some(Interrupted::TimedOut);
        let cancelled = output.interrupted == Some(Interrupted::Cancelled);

        let error = if cancelled {
            Some("cancelled by user".to_string())
        } else if timed_out {
            Some(format!(
                "timed out after {:?}",
                self.timeout.unwrap_or_default()
            ))
        } else if !exited_ok {
            Some(match exit_code {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            })
        } else {
            None
        };

        debug!(exit_code, timed_out, cancelled, "command result");
        Ok(ExecutionResult {
            stdout,
            stderr,
            success: exited_ok && output.interrupted.is_none(),
            exit_code,
            error,
            timed_out,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn posix_prefers_configured_shell() {
        let info = ShellInfo::resolve(false, env_of(&[("SHELL", "/usr/bin/zsh")]));
        assert_eq!(info.name, "zsh");
        assert_eq!(info.program, PathBuf::from("/usr/bin/zsh"));
        assert_eq!(info.flavor, ShellFlavor::Posix);
    }

    #[test]
    fn posix_falls_back_to_bin_sh() {
        let info = ShellInfo::resolve(false, env_of(&[("SHELL", "  ")]));
        assert_eq!(info.program, PathBuf::from(POSIX_DEFAULT_SHELL));
        assert_eq!(info.name, "sh");
    }

    #[test]
    fn windows_prefers_powershell_then_comspec() {
        let info = ShellInfo::resolve(true, env_of(&[("PSModulePath", "C:\\ps")]));
        assert_eq!(info.flavor, ShellFlavor::PowerShell);

        let info = ShellInfo::resolve(true, env_of(&[("COMSPEC", "D:\\cmd.exe")]));
        assert_eq!(info.flavor, ShellFlavor::Cmd);
        assert_eq!(info.program, PathBuf::from("D:\\cmd.exe"));

        let info = ShellInfo::resolve(true, env_of(&[]));
        assert_eq!(info.program, PathBuf::from(WINDOWS_DEFAULT_COMSPEC));
    }

    #[test]
    fn command_arguments_follow_flavor() {
        let info = ShellInfo::resolve(true, env_of(&[]));
        let cmd = info.command("dir");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["/C", "dir"]);
    }

    #[test]
    fn missing_directory_fails_before_spawn() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("missing");
        let shell = HostShell::new(ShellInfo::detect(), None, 1000, CancelToken::new());
        let err = shell.execute("echo hi", &missing).unwrap_err();
        assert_eq!(err, ShellError::InvalidWorkingDirectory(missing));
    }

    #[cfg(unix)]
    fn posix_shell() -> HostShell {
        let info = ShellInfo::resolve(false, env_of(&[]));
        HostShell::new(info, Some(Duration::from_secs(10)), 10_000, CancelToken::new())
    }

    #[cfg(unix)]
    #[test]
    fn runs_command_in_working_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write marker");
        let result = posix_shell().execute("ls", temp.path()).expect("execute");
        assert!(result.success);
        assert!(result.stdout.contains("marker.txt"));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.error, None);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_failed_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = posix_shell()
            .execute("echo oops >&2; exit 3", temp.path())
            .expect("execute");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(result.error.as_deref(), Some("exited with status 3"));
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failure_is_a_failed_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let info = ShellInfo::resolve(false, env_of(&[("SHELL", "/nonexistent/shell")]));
        let shell = HostShell::new(info, None, 1000, CancelToken::new());
        let result = shell.execute("echo hi", temp.path()).expect("execute");
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn timeout_marks_result_incomplete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let info = ShellInfo::resolve(false, env_of(&[]));
        let shell = HostShell::new(info, Some(Duration::from_millis(100)), 1000, CancelToken::new());
        let result = shell.execute("exec sleep 5", temp.path()).expect("execute");
        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.is_incomplete());
    }
}
