// [[file:../fleet.note::a14f6c02][a14f6c02]]
//! Remote execution on fleet machines: push a file, run a command.
//!
//! There is no retry at this layer. Some remote operations, like formatting
//! the distributed filesystem, must happen exactly once, so the caller
//! decides what may be repeated.
// a14f6c02 ends here

// [[file:../fleet.note::77b43c27][77b43c27]]
use crate::base::{shell_escape, shell_join};
use crate::common::*;

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
// 77b43c27 ends here

// [[file:../fleet.note::0b562a75][0b562a75]]
/// Whether to wait for the remote command to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Wait for full completion and return the exit status.
    Wait,
    /// Return once the remote shell started the command in the background.
    /// Used for daemon-starting scripts.
    Detach,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to push {path} to {machine}: {reason}")]
    Push {
        machine: String,
        path: String,
        reason: String,
    },
    #[error("failed to run {command:?} on {machine}: {reason}")]
    Run {
        machine: String,
        command: String,
        reason: String,
    },
}

impl GatewayError {
    pub fn machine(&self) -> &str {
        match self {
            Self::Push { machine, .. } | Self::Run { machine, .. } => machine,
        }
    }
}

/// The remote-execution transport.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Copy local file `local` to `remote` on `machine`.
    async fn push(&self, machine: &str, local: &Path, remote: &str) -> Result<(), GatewayError>;

    /// Run shell `command` on `machine`, optionally as `as_user`, and return
    /// its exit status. In `Detach` mode the status is that of starting it.
    async fn run(&self, machine: &str, command: &str, as_user: Option<&str>, mode: RunMode) -> Result<i32, GatewayError>;

    /// Run `command` to completion and capture its standard output. A
    /// non-zero exit status is a run failure.
    async fn output(&self, machine: &str, command: &str, as_user: Option<&str>) -> Result<String, GatewayError>;
}
// 0b562a75 ends here

// [[file:../fleet.note::e5fdc097][e5fdc097]]
/// Push `local_script` to a scratch location on `machine` and run it there
/// with `args`. Returns the exit status of the script.
pub async fn push_and_run(
    shell: &dyn RemoteShell,
    machine: &str,
    local_script: &Path,
    args: &[String],
    as_user: Option<&str>,
    mode: RunMode,
) -> Result<i32, GatewayError> {
    let file_name = local_script.file_name().and_then(|x| x.to_str()).ok_or_else(|| GatewayError::Push {
        machine: machine.into(),
        path: local_script.display().to_string(),
        reason: "not a file name".into(),
    })?;
    let remote = format!("/tmp/{file_name}");
    shell.push(machine, local_script, &remote).await?;

    let command = format!("chmod +x {} && {}", shell_escape(&remote), shell_join(std::iter::once(&remote).chain(args)));
    shell.run(machine, &command, as_user, mode).await
}

/// Wrap `command` so that it runs as `as_user` in a login shell.
pub(crate) fn wrap_user(command: &str, as_user: Option<&str>) -> String {
    match as_user {
        Some(user) => format!("sudo -u {} -i bash -c {}", shell_escape(user), shell_escape(command)),
        None => format!("sudo bash -c {}", shell_escape(command)),
    }
}

/// Wrap `command` so that it keeps running after the connection closes.
pub(crate) fn wrap_detach(command: &str) -> String {
    let log = format!("/tmp/gosh-fleet-{}.log", crate::base::random_name(6));
    format!("nohup bash -c {} > {log} 2>&1 < /dev/null &", shell_escape(command))
}
// e5fdc097 ends here

// [[file:../fleet.note::99dad0b0][99dad0b0]]
/// Remote execution through `gcloud compute scp/ssh`.
#[derive(Debug, Clone)]
pub struct GcloudShell {
    program: String,
    project: String,
    zone: String,
}

/// ssh reports its own failures with this exit status.
const SSH_TRANSPORT_FAILURE: i32 = 255;

impl GcloudShell {
    pub fn new(program: impl Into<String>, project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            project: project.into(),
            zone: zone.into(),
        }
    }

    fn gcloud(&self, sub: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("compute")
            .arg(sub)
            .arg(format!("--project={}", self.project))
            .arg(format!("--zone={}", self.zone))
            .arg("--quiet")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn ssh(&self, machine: &str, command: &str) -> tokio::process::Command {
        let mut cmd = self.gcloud("ssh");
        cmd.arg(machine)
            .arg("--ssh-flag=-o ConnectTimeout=10")
            .arg(format!("--command={command}"));
        cmd
    }

    fn run_error(machine: &str, command: &str, reason: impl Into<String>) -> GatewayError {
        GatewayError::Run {
            machine: machine.into(),
            command: command.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RemoteShell for GcloudShell {
    async fn push(&self, machine: &str, local: &Path, remote: &str) -> Result<(), GatewayError> {
        debug!("push {} to {machine}:{remote}", local.display());
        let push_error = |reason: String| GatewayError::Push {
            machine: machine.into(),
            path: local.display().to_string(),
            reason,
        };
        let out = self
            .gcloud("scp")
            .arg(local)
            .arg(format!("{machine}:{remote}"))
            .output()
            .await
            .map_err(|e| push_error(e.to_string()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(push_error(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn run(&self, machine: &str, command: &str, as_user: Option<&str>, mode: RunMode) -> Result<i32, GatewayError> {
        let mut remote = wrap_user(command, as_user);
        if mode == RunMode::Detach {
            remote = wrap_detach(&remote);
        }
        debug!("run on {machine}: {remote}");
        let status = self
            .ssh(machine, &remote)
            .status()
            .await
            .map_err(|e| Self::run_error(machine, command, e.to_string()))?;
        match status.code() {
            Some(SSH_TRANSPORT_FAILURE) => Err(Self::run_error(machine, command, "ssh connection failed")),
            Some(code) => Ok(code),
            None => Err(Self::run_error(machine, command, "killed by signal")),
        }
    }

    async fn output(&self, machine: &str, command: &str, as_user: Option<&str>) -> Result<String, GatewayError> {
        let remote = wrap_user(command, as_user);
        debug!("capture output on {machine}: {remote}");
        let out = self
            .ssh(machine, &remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Self::run_error(machine, command, e.to_string()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let code = out.status.code().unwrap_or(-1);
            return Err(Self::run_error(machine, command, format!("exit status {code}: {}", stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}
// 99dad0b0 ends here

// [[file:../fleet.note::2d84a9f3][2d84a9f3]]
#[test]
fn test_wrap_commands() {
    assert_eq!(wrap_user("ls /", Some("hadoop")), "sudo -u hadoop -i bash -c 'ls /'");
    assert_eq!(wrap_user("ls", None), "sudo bash -c ls");

    let detached = wrap_detach("start namenode");
    assert!(detached.starts_with("nohup bash -c 'start namenode' > /tmp/gosh-fleet-"));
    assert!(detached.ends_with("2>&1 < /dev/null &"));
}
// 2d84a9f3 ends here
