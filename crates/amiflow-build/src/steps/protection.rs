use super::finish;
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, CloudError, Result, Step, StepAction, fan_out};
use amiflow_config::{DeregistrationProtection, FastLaunchConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

fn regions_of(state: &BuildState) -> Vec<String> {
    state.amis.keys().cloned().collect()
}

/// Schedule deprecation and enable deregistration protection
pub struct StepImageProtection {
    deprecate_at: Option<DateTime<Utc>>,
    protection: DeregistrationProtection,
}

impl StepImageProtection {
    pub fn new(deprecate_at: Option<DateTime<Utc>>, protection: DeregistrationProtection) -> Self {
        Self {
            deprecate_at,
            protection,
        }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<()> {
        if self.deprecate_at.is_none() && !self.protection.enabled {
            return Ok(());
        }
        let amis = state.amis.clone();
        let clients = state.clients.regions.clone();

        if let Some(at) = self.deprecate_at {
            state
                .ui
                .say(&format!("Setting AMI deprecation time to {}", at.to_rfc3339()));
        }
        if self.protection.enabled {
            state.ui.say("Enabling deregistration protection");
        }

        let outcome = fan_out(&regions_of(state), |region| {
            let clients = clients.clone();
            let image_id = amis.get(&region).cloned().unwrap_or_default();
            async move {
                let compute = clients.compute(&region).await?;
                if let Some(at) = self.deprecate_at {
                    compute.enable_image_deprecation(&image_id, at).await?;
                }
                if self.protection.enabled {
                    compute
                        .enable_deregistration_protection(&image_id, self.protection.with_cooldown)
                        .await?;
                }
                Ok(())
            }
        })
        .await;
        outcome.errors.into_result()
    }
}

#[async_trait]
impl Step<BuildState> for StepImageProtection {
    fn name(&self) -> &'static str {
        "image_protection"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}

/// Pre-provision snapshots for faster Windows launches
pub struct StepEnableFastLaunch {
    config: FastLaunchConfig,
}

impl StepEnableFastLaunch {
    pub fn new(config: FastLaunchConfig) -> Self {
        Self { config }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        if !self.config.enable_fast_launch {
            return Ok(());
        }
        state.ui.say("Enabling fast launch on the AMI...");
        let amis = state.amis.clone();
        let clients = state.clients.regions.clone();
        let waiter = state.waiter();
        let parallel = self.config.max_parallel_launches();

        let outcome = fan_out(&regions_of(state), |region| {
            let clients = clients.clone();
            let image_id = amis.get(&region).cloned().unwrap_or_default();
            async move {
                let compute = clients.compute(&region).await?;
                compute.enable_fast_launch(&image_id, parallel).await?;
                waiter
                    .until_state(
                        cancel,
                        "fast launch to be enabled",
                        "enabled",
                        &["enabling-failed"],
                        || compute.fast_launch_state(&image_id),
                    )
                    .await
            }
        })
        .await;

        if outcome.is_success() {
            Ok(())
        } else {
            Err(CloudError::Multi(outcome.errors))
        }
    }
}

#[async_trait]
impl Step<BuildState> for StepEnableFastLaunch {
    fn name(&self) -> &'static str {
        "enable_fast_launch"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}
