use super::finish;
use crate::state::BuildState;
use amiflow_cloud::{Backoff, CancellationToken, Result, Retry, Step, StepAction};
use async_trait::async_trait;
use std::time::Duration;

/// Stop the source instance so its volumes are consistent for imaging
pub struct StepStopInstance {
    disable_stop_instance: bool,
}

impl StepStopInstance {
    pub fn new(disable_stop_instance: bool) -> Self {
        Self {
            disable_stop_instance,
        }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let instance_id = state.instance()?.id.clone();
        let compute = state.clients.compute.clone();

        if self.disable_stop_instance {
            state.ui.say(
                "Automatic instance stop disabled. Please stop the instance from a provisioner.",
            );
        } else {
            state.ui.say("Stopping the source instance...");
            Retry::new(10)
                .backoff(Backoff::Exponential {
                    initial: Duration::from_secs(1),
                    multiplier: 2.0,
                    max: Duration::from_secs(30),
                })
                .retry_if(|e| e.is_not_found() || e.is_throttled())
                .run(cancel, || compute.stop_instance(&instance_id))
                .await?;
        }

        state.ui.say("Waiting for the instance to stop...");
        state
            .waiter()
            .until_state(
                cancel,
                "instance to stop",
                "stopped",
                &["terminated", "shutting-down"],
                || async {
                    let instance = compute.describe_instance(&instance_id).await?;
                    Ok(instance.state.as_str().to_string())
                },
            )
            .await
    }
}

#[async_trait]
impl Step<BuildState> for StepStopInstance {
    fn name(&self) -> &'static str {
        "stop_instance"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}
