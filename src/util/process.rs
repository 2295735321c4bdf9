//! Subprocess execution utilities.
//!
//! Every external tool call goes through [`ProcessBuilder`], which records the
//! command at debug level (with secret arguments redacted) and enforces an
//! optional deadline.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use thiserror::Error;

/// Interval between exit checks while a deadline is active.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A command exceeded its deadline and was killed.
#[derive(Debug, Error)]
#[error("`{command}` did not finish within {}s and was killed", .timeout.as_secs())]
pub struct ProcessTimeout {
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
struct Arg {
    value: String,
    secret: bool,
}

/// Builder for subprocess execution.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    program: PathBuf,
    args: Vec<Arg>,
    timeout: Option<Duration>,
}

impl ProcessBuilder {
    /// Create a new process builder for the given program.
    pub fn new(program: impl AsRef<Path>) -> Self {
        ProcessBuilder {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(Arg {
            value: arg.as_ref().to_string_lossy().into_owned(),
            secret: false,
        });
        self
    }

    /// Add an argument that must never appear in logs.
    pub fn secret_arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(Arg {
            value: arg.as_ref().to_string_lossy().into_owned(),
            secret: true,
        });
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Kill the process if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get the literal arguments, secrets included.
    pub fn get_args(&self) -> Vec<&str> {
        self.args.iter().map(|a| a.value.as_str()).collect()
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| &a.value));
        cmd
    }

    /// Execute the command and wait for completion.
    pub fn exec(&self) -> Result<Output> {
        tracing::debug!(command = %self.display_command(), "exec");

        let mut cmd = self.build_command();
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.program.display()))?;

        // Drain both pipes on their own threads so a chatty child cannot block
        // on a full pipe while we poll for exit.
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = self.wait(&mut child)?;

        Ok(Output {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus> {
        let Some(timeout) = self.timeout else {
            return child
                .wait()
                .with_context(|| format!("failed to wait for `{}`", self.program.display()));
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("failed to poll `{}`", self.program.display()))?
            {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessTimeout {
                    command: self.display_command(),
                    timeout,
                }
                .into());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Execute and require success.
    pub fn exec_and_check(&self) -> Result<Output> {
        let output = self.exec()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "`{}` failed with exit code {:?}\n{}",
                self.display_command(),
                output.status.code(),
                stderr.trim_end()
            );
        }
        Ok(output)
    }

    /// Display the command for logs and error messages, secrets redacted.
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| {
            if a.secret {
                "<redacted>".to_string()
            } else if a.value.contains(' ') {
                format!("'{}'", a.value)
            } else {
                a.value.clone()
            }
        }));
        parts.join(" ")
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Resolve a bare name against `PATH`, or check that a path is executable.
pub fn find_executable(program: impl AsRef<OsStr>) -> Option<PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_builder() {
        let output = ProcessBuilder::new("echo").arg("hello").exec().unwrap();

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.trim() == "hello" || stdout.contains("hello"));
    }

    #[test]
    fn test_display_command_redacts_secrets() {
        let pb = ProcessBuilder::new("qm")
            .args(["set", "9000", "--cipassword"])
            .secret_arg("$6$salt$hash")
            .args(["--name", "debian 12"]);

        assert_eq!(
            pb.display_command(),
            "qm set 9000 --cipassword <redacted> --name 'debian 12'"
        );
        assert!(pb.get_args().contains(&"$6$salt$hash"));
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_and_check_reports_failure() {
        let err = ProcessBuilder::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .exec_and_check()
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Some(3)"));
        assert!(msg.contains("boom"));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_process() {
        let started = Instant::now();
        let err = ProcessBuilder::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .exec()
            .unwrap_err();

        assert!(err.downcast_ref::<ProcessTimeout>().is_some());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
