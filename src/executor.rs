// SPDX-License-Identifier: MIT
//! Process Executor (spec §4.4): spawns a resolved binary, exposes its
//! pipes, and drains stderr so a chatty backend can't block on a full
//! pipe buffer. Grounded in the teacher's `lsp::proxy` child-process setup
//! and `process_pool`'s liveness check (`libc::kill(pid, 0)`).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use crate::error::SpawnIoError;

/// A spawned child process's pipes and lifecycle handles.
pub struct Process {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl Process {
    pub async fn wait(mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    pub fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Splits the handle into its child and pipes. Once the pipes are
    /// handed to a `Connection`, only the `Child` needs to be retained for
    /// `wait`/`kill` — keeping the whole `Process` around after a partial
    /// move of its fields does not type-check.
    pub fn into_parts(self) -> (Child, ChildStdin, ChildStdout) {
        (self.child, self.stdin, self.stdout)
    }
}

/// Spawns `path` with `args`, the current environment overlaid with `env`,
/// and working directory `workdir`. Stderr is drained on a background task
/// that line-prefixes each line with `name` (spec §4.4).
pub fn spawn(
    name: &str,
    path: &Path,
    args: &[String],
    env: &HashMap<String, String>,
    workdir: Option<&Path>,
) -> Result<Process, SpawnIoError> {
    let mut cmd = Command::new(path);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => warn!(backend = %name, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    warn!(backend = %name, err = %e, "stderr read failed");
                    break;
                }
            }
        }
    });

    info!(backend = %name, pid = ?child.id(), "backend process spawned");

    Ok(Process {
        child,
        stdin,
        stdout,
    })
}

/// True if a process with this pid is still alive, checked via a
/// zero-signal `kill` the way the teacher's `process_pool` does.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checks; pid is a plain integer with no aliasing concerns.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_drains_stderr() {
        let path = Path::new("/bin/sh");
        if !path.exists() {
            return;
        }
        let args = vec![
            "-c".to_string(),
            "echo hello-stderr 1>&2; cat".to_string(),
        ];
        let mut process = spawn("test", path, &args, &HashMap::new(), None).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        process.kill().ok();
    }
}
