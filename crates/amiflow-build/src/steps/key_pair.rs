use super::{finish, ignore_not_found};
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, Result, Step, StepAction};
use amiflow_config::CommConfig;
use async_trait::async_trait;
use tracing::info;

/// Use the configured key, or create a temporary key pair
pub struct StepKeyPair {
    comm: CommConfig,
    created: Option<String>,
}

impl StepKeyPair {
    pub fn new(comm: CommConfig) -> Self {
        Self {
            comm,
            created: None,
        }
    }

    async fn execute(&mut self, state: &mut BuildState) -> Result<()> {
        if !self.comm.uses_ssh() {
            return Ok(());
        }

        if let Some(path) = &self.comm.ssh_private_key_file {
            state.ui.say("Using existing SSH private key");
            let key = tokio::fs::read_to_string(path).await?;
            state.ssh.private_key = Some(key);
            state.ssh.key_pair_name = self.comm.ssh_keypair_name.clone();
            return Ok(());
        }

        let name = format!("amiflow_{}", uuid::Uuid::new_v4());
        state
            .ui
            .say(&format!("Creating temporary keypair: {}", name));
        let key_pair = state.clients.compute.create_key_pair(&name).await?;
        info!(key_pair = %name, "Created temporary key pair");
        self.created = Some(key_pair.name.clone());
        state.ssh.key_pair_name = Some(key_pair.name);
        state.ssh.private_key = Some(key_pair.private_key);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepKeyPair {
    fn name(&self) -> &'static str {
        "key_pair"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let Some(name) = self.created.take() else {
            return Ok(());
        };
        state.ui.say("Deleting temporary keypair...");
        let result = ignore_not_found(state.clients.compute.delete_key_pair(&name).await);
        if let Err(e) = &result {
            state.ui.error(&format!(
                "Error cleaning up keypair {}: {}. Please delete it manually.",
                name, e
            ));
        }
        result
    }
}
