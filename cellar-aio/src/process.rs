// cellar-aio/src/process.rs
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use cellar_common::error::{CellarError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error};

/// A fully specified external command. The environment is exact: nothing is
/// inherited from the calling process.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    /// Combined stdout/stderr are appended here when set.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        matches!(self.termination, Termination::Exited(s) if s.success())
    }

    /// Human readable outcome, e.g. `exit status: 2` or `timed out after 5s`.
    pub fn status_string(&self) -> String {
        match &self.termination {
            Termination::Exited(s) => s.to_string(),
            Termination::TimedOut(d) => format!("timed out after {}s", d.as_secs()),
        }
    }
}

/// Runs `spec` in its own process group. On timeout or cancellation the whole
/// group is killed, so compilers spawned by `make` die with it. Cancellation
/// returns `CellarError::Cancelled`; a timeout is reported in the output.
pub async fn run_command_async(
    spec: &CommandSpec,
    timeout: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<CommandOutput> {
    debug!(
        "Running command: {} {:?} (cwd: {:?}, env keys: {:?})",
        spec.program,
        spec.args,
        spec.cwd,
        spec.env.keys().collect::<Vec<_>>()
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        error!("Failed to execute {}: {}", spec.program, e);
        CellarError::CommandExecError(format!("{}: {e}", spec.program))
    })?;
    let pid = child.id();

    // Stdin is fed alongside the wait so a child that never reads it still
    // honors the timeout and cancellation.
    let feed = spec.stdin.as_deref().zip(child.stdin.take());
    let output = async move {
        let write = async move {
            if let Some((input, mut pipe)) = feed {
                match pipe.write_all(input.as_bytes()).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };
        let (written, out) = tokio::join!(write, child.wait_with_output());
        written?;
        out
    };
    tokio::pin!(output);

    let expired = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    let result = tokio::select! {
        res = &mut output => {
            let out = res?;
            Ok(CommandOutput {
                termination: Termination::Exited(out.status),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            })
        }
        _ = expired => {
            kill_process_group(pid);
            Ok(CommandOutput {
                termination: Termination::TimedOut(timeout.unwrap_or_default()),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
        _ = cancelled(cancel) => {
            kill_process_group(pid);
            Err(CellarError::Cancelled(format!("{} interrupted", spec.program)))
        }
    };

    if let Ok(out) = &result {
        if !out.success() {
            debug!("Command {} failed: {}", spec.program, out.status_string());
            if !out.stderr.trim().is_empty() {
                debug!("Stderr:\n{}", out.stderr.trim());
            }
        }
        if let Some(log) = &spec.log_file {
            append_log(log, spec, out);
        }
    }
    result
}

/// Resolves once the flag flips to true; never if the sender goes away.
pub async fn cancelled(cancel: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = cancel {
        if rx.wait_for(|c| *c).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            debug!("Killing process group {}", pid);
            // SAFETY: plain syscall on a group id we created via process_group(0).
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn append_log(path: &std::path::Path, spec: &CommandSpec, out: &CommandOutput) {
    use std::io::Write;
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "$ {} {}", spec.program, spec.args.join(" "))?;
        f.write_all(out.stdout.as_bytes())?;
        f.write_all(out.stderr.as_bytes())?;
        writeln!(f, "[{}]", out.status_string())
    };
    if let Err(e) = write() {
        debug!("Could not write command log {}: {}", path.display(), e);
    }
}
