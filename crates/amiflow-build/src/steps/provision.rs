use super::finish;
use crate::communicator::{Communicator, SshCommunicator, SshTarget, run_checked, write_private_key};
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, CloudError, Instance, Result, Step, StepAction};
use amiflow_config::CommConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Open the communicator to the source instance
pub struct StepConnect {
    comm: CommConfig,
    key_file: Option<tempfile::NamedTempFile>,
}

impl StepConnect {
    pub fn new(comm: CommConfig) -> Self {
        Self {
            comm,
            key_file: None,
        }
    }

    fn host(&self, instance: &Instance) -> Result<String> {
        let host = match self.comm.ssh_interface.as_deref() {
            Some("private_ip") => instance.private_ip.clone(),
            Some("public_dns") => instance.public_dns.clone(),
            Some("public_ip") => instance.public_ip.clone(),
            _ => instance.public_ip.clone().or_else(|| instance.private_ip.clone()),
        };
        host.ok_or_else(|| {
            CloudError::InvalidConfig(format!(
                "instance {} has no address for ssh_interface {}",
                instance.id,
                self.comm.ssh_interface.as_deref().unwrap_or("default")
            ))
        })
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        if state.communicator.is_some() {
            debug!("Communicator supplied by the caller");
            return Ok(());
        }
        if !self.comm.uses_ssh() {
            return Ok(());
        }

        let instance = state.instance()?;
        let host = self.host(instance)?;
        let key = state
            .ssh
            .private_key
            .as_deref()
            .ok_or(CloudError::MissingState("ssh.private_key"))?;
        let key_file = write_private_key(&std::env::temp_dir(), key)?;

        let ssh = SshCommunicator::new(SshTarget {
            host: host.clone(),
            port: self.comm.ssh_port,
            username: self.comm.ssh_username.clone().unwrap_or_default(),
            key_file: key_file.path().to_path_buf(),
        });
        self.key_file = Some(key_file);

        state
            .ui
            .say(&format!("Waiting for SSH to become available on {}...", host));
        ssh.wait_ready(cancel, self.comm.ssh_timeout()).await?;
        state.ui.say("Connected to SSH!");

        state.communicator = Some(Arc::new(ssh));
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepConnect {
    fn name(&self) -> &'static str {
        "connect"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        if let Some(file) = self.key_file.take() {
            file.close()?;
        }
        Ok(())
    }
}

/// Run the template's shell provisioners through the communicator
pub struct StepProvision {
    commands: Vec<String>,
}

impl StepProvision {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let communicator = state.communicator().map_err(|_| {
            CloudError::InvalidConfig(
                "provisioners need a communicator; set communicator to ssh".to_string(),
            )
        })?;

        state.ui.say("Provisioning with shell commands...");
        run_commands(cancel, state, communicator.as_ref(), &self.commands).await
    }
}

/// Run each command in turn, echoing its output; stop at the first failure
pub(crate) async fn run_commands(
    cancel: &CancellationToken,
    state: &BuildState,
    communicator: &dyn Communicator,
    commands: &[String],
) -> Result<()> {
    for command in commands {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }
        state.ui.message(&format!("Running: {}", command));
        let output = run_checked(communicator, command).await?;
        for line in output.lines() {
            state.ui.message(line);
        }
    }
    Ok(())
}

#[async_trait]
impl Step<BuildState> for StepProvision {
    fn name(&self) -> &'static str {
        "provision"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}
