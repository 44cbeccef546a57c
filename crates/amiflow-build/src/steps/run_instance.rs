use super::{finish, to_mappings};
use crate::state::BuildState;
use amiflow_cloud::{
    Backoff, CancellationToken, CloudError, MetadataOptions, Result, Retry, RunInstanceRequest,
    Step, StepAction, Tag,
};
use amiflow_config::{BlockDevice, RunConfig};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_NAME_TAG: &str = "Amiflow Builder";

/// Launch the source instance and wait until it is running
pub struct StepRunSourceInstance {
    run: RunConfig,
    launch_mappings: Vec<BlockDevice>,
    instance_id: Option<String>,
}

impl StepRunSourceInstance {
    pub fn new(run: RunConfig, launch_mappings: Vec<BlockDevice>) -> Self {
        Self {
            run,
            launch_mappings,
            instance_id: None,
        }
    }

    fn request(&self, state: &mut BuildState) -> Result<RunInstanceRequest> {
        let source = state.source_image()?.id.clone();

        let mut run_tags = self.run.run_tags.clone();
        run_tags
            .entry("Name".to_string())
            .or_insert_with(|| DEFAULT_NAME_TAG.to_string());
        let tags = state.names.render_tags(&run_tags)?;
        let volume_tags = state.names.render_tags(&self.run.run_volume_tags)?;

        let meta = &self.run.metadata_options;
        Ok(RunInstanceRequest {
            image_id: source,
            instance_type: self.run.instance_type.clone(),
            subnet_id: self.run.subnet_id.clone(),
            availability_zone: self.run.availability_zone.clone(),
            security_group_ids: state.security_group_ids.clone().unwrap_or_default(),
            key_name: state.ssh.key_pair_name.clone(),
            iam_instance_profile: state.instance_profile.clone(),
            user_data: self.run.load_user_data()?,
            block_device_mappings: to_mappings(&self.launch_mappings),
            tags,
            volume_tags,
            tag_on_create: state.tag_on_create,
            associate_public_ip: self.run.associate_public_ip_address,
            ebs_optimized: self.run.ebs_optimized,
            metadata_options: Some(MetadataOptions {
                http_endpoint: Some(meta.http_endpoint.clone()),
                http_tokens: meta.http_tokens.clone(),
                http_put_response_hop_limit: Some(meta.http_put_response_hop_limit),
                instance_metadata_tags: meta.instance_metadata_tags.clone(),
            }),
            credit_specification: self
                .run
                .enable_unlimited_credits
                .then(|| "unlimited".to_string()),
            tenancy: self.run.tenancy.clone(),
            shutdown_behavior: self.run.shutdown_behavior.clone(),
        })
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let request = self.request(state)?;
        let compute = state.clients.compute.clone();

        state.ui.say("Launching a source AWS instance...");
        // A fresh instance profile takes a while to become usable by EC2
        let launch = Retry::new(20)
            .backoff(Backoff::Constant(Duration::from_secs(5)))
            .retry_if(|e| {
                e.is_throttled()
                    || (e.is_code(&["InvalidParameterValue"])
                        && e.api_message().is_some_and(|m| m.contains("iamInstanceProfile")))
            });
        let instance_id = launch.run(cancel, || compute.run_instance(&request)).await?;
        self.instance_id = Some(instance_id.clone());
        info!(instance = %instance_id, "Launched source instance");
        state
            .ui
            .message(&format!("Instance ID: {}", instance_id));

        state
            .ui
            .say(&format!("Waiting for instance ({}) to become ready...", instance_id));
        let waited = state
            .waiter()
            .tolerate_not_found()
            .until_state(
                cancel,
                "instance to become running",
                "running",
                &["terminated", "shutting-down", "stopped"],
                || async {
                    let instance = compute.describe_instance(&instance_id).await?;
                    Ok(instance.state.as_str().to_string())
                },
            )
            .await;
        if let Err(e) = waited {
            return Err(match compute.describe_instance(&instance_id).await {
                Ok(instance) if instance.state_reason.is_some() => CloudError::UnexpectedState {
                    what: format!("instance {}", instance_id),
                    state: format!(
                        "{} ({})",
                        instance.state.as_str(),
                        instance.state_reason.unwrap_or_default()
                    ),
                },
                _ => e,
            });
        }

        let instance = compute.describe_instance(&instance_id).await?;
        if let Some(ip) = &instance.public_ip {
            state.ui.message(&format!("Public IP: {}", ip));
        }
        if let Some(ip) = &instance.private_ip {
            state.ui.message(&format!("Private IP: {}", ip));
        }

        if !request.tag_on_create {
            tag_after_launch(cancel, state, &instance_id, &request.tags).await?;
        }

        state.instance = Some(instance);
        Ok(())
    }
}

/// Tags applied separately where launch requests cannot carry them
async fn tag_after_launch(
    cancel: &CancellationToken,
    state: &BuildState,
    instance_id: &str,
    tags: &[Tag],
) -> Result<()> {
    if tags.is_empty() {
        return Ok(());
    }
    state.ui.say("Adding tags to source instance");
    let compute = state.clients.compute.clone();
    let ids = vec![instance_id.to_string()];
    // New instance IDs can briefly be unknown to the tagging API
    Retry::new(10)
        .backoff(Backoff::Constant(Duration::from_secs(2)))
        .retry_if(|e| e.is_not_found() || e.is_throttled())
        .run(cancel, || compute.create_tags(&ids, tags))
        .await
}

#[async_trait]
impl Step<BuildState> for StepRunSourceInstance {
    fn name(&self) -> &'static str {
        "run_source_instance"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let Some(instance_id) = self.instance_id.take() else {
            return Ok(());
        };
        state.ui.say("Terminating the source AWS instance...");
        let compute = state.clients.compute.clone();

        match compute.terminate_instance(&instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Failed to terminate instance");
                state.ui.error(&format!(
                    "Error terminating instance {}: {}. Please terminate it manually.",
                    instance_id, e
                ));
                return Err(e);
            }
        }

        state
            .waiter()
            .tolerate_not_found()
            .until_state(
                &CancellationToken::new(),
                "instance to terminate",
                "terminated",
                &[],
                || async {
                    match compute.describe_instance(&instance_id).await {
                        Ok(instance) => Ok(instance.state.as_str().to_string()),
                        Err(e) if e.is_not_found() => Ok("terminated".to_string()),
                        Err(e) => Err(e),
                    }
                },
            )
            .await
    }
}
