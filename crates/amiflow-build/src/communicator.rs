//! Running commands on the machine being imaged
//!
//! - [`LocalShell`]: `sh -c` on the build host
//! - [`ChrootShell`]: inside a mounted root, through the host shell
//! - [`SshCommunicator`]: on the source instance via the `ssh` CLI

use crate::template::render_with;
use amiflow_cloud::{CancellationToken, CloudError, Probe, Result, Waiter};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Communicator: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput>;
}

/// Run a command and fail on a non-zero exit, returning stdout
pub async fn run_checked(communicator: &dyn Communicator, command: &str) -> Result<String> {
    let output = communicator.run(command).await?;
    if !output.success() {
        return Err(CloudError::CommandFailed(format!(
            "`{}` exited with status {}: {}",
            command,
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Quote a value for a POSIX shell
pub fn shell_escape(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

async fn collect(mut command: Command) -> Result<CommandOutput> {
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    let output = command.output().await?;
    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// `sh -c` on the build host
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalShell;

#[async_trait]
impl Communicator for LocalShell {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(command, "Running local command");
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        collect(cmd).await
    }
}

/// Commands inside a mounted root filesystem
pub struct ChrootShell {
    root: PathBuf,
    host: Arc<dyn Communicator>,
    wrapper: String,
}

impl ChrootShell {
    pub fn new(
        root: impl Into<PathBuf>,
        host: Arc<dyn Communicator>,
        wrapper: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            host,
            wrapper: wrapper.into(),
        }
    }

    pub fn command_for(&self, command: &str) -> Result<String> {
        let chroot = format!(
            "chroot {} /bin/sh -c {}",
            shell_escape(&self.root.to_string_lossy()),
            shell_escape(command)
        );
        render_with(&self.wrapper, &[("command", chroot.as_str())])
    }
}

#[async_trait]
impl Communicator for ChrootShell {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let wrapped = self.command_for(command)?;
        debug!(root = %self.root.display(), command, "Running chroot command");
        self.host.run(&wrapped).await
    }
}

/// Connection settings for [`SshCommunicator`]
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_file: PathBuf,
}

/// Runs commands over the system `ssh` client
pub struct SshCommunicator {
    target: SshTarget,
}

impl SshCommunicator {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.target.key_file)
            .arg("-p")
            .arg(self.target.port.to_string())
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "LogLevel=ERROR",
            ])
            .arg(format!("{}@{}", self.target.username, self.target.host))
            .arg(remote);
        cmd
    }

    /// Poll until a trivial command succeeds or `timeout` elapses
    pub async fn wait_ready(&self, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
        let waiter = Waiter::new(Duration::from_secs(5), timeout);
        waiter
            .until(cancel, "SSH to become available", || async {
                match self.run("exit 0").await {
                    Ok(output) if output.success() => Ok(Probe::Ready(())),
                    Ok(output) => Ok(Probe::Pending(output.stderr.trim().to_string())),
                    Err(e) => Ok(Probe::Pending(e.to_string())),
                }
            })
            .await
    }
}

#[async_trait]
impl Communicator for SshCommunicator {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.target.host, command, "Running remote command");
        collect(self.command(command)).await
    }
}

/// Write a private key where `ssh -i` will accept it
pub fn write_private_key(dir: &Path, key: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("amiflow-key-")
        .tempfile_in(dir)?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("/dev/xvdf1"), "/dev/xvdf1");
        assert_eq!(shell_escape("echo hi"), "'echo hi'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_chroot_command_is_wrapped() {
        let shell = ChrootShell::new("/mnt/root", Arc::new(LocalShell), "sudo {{ command }}");
        assert_eq!(
            shell.command_for("apt-get update").unwrap(),
            "sudo chroot /mnt/root /bin/sh -c 'apt-get update'"
        );
    }

    #[tokio::test]
    async fn test_local_shell_reports_exit_code() {
        let output = LocalShell.run("echo out; echo err >&2; exit 3").await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");

        let err = run_checked(&LocalShell, "exit 1").await.unwrap_err();
        assert!(matches!(err, CloudError::CommandFailed(_)));
    }

    #[test]
    fn test_private_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_private_key(dir.path(), "KEY").unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "KEY\n");
    }
}
