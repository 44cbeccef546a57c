use super::{finish, ignore_not_found};
use crate::state::BuildState;
use amiflow_cloud::{
    CancellationToken, CloudError, ComputeApi, CreateVolumeRequest, Result, Step, StepAction,
    Waiter,
};
use amiflow_config::ChrootConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Create the volume the chroot is built on
pub struct StepCreateVolume {
    from_scratch: bool,
    root_volume_size: Option<i32>,
    root_volume_type: Option<String>,
    root_volume_tags: BTreeMap<String, String>,
    encrypted: Option<bool>,
    kms_key_id: Option<String>,
    volume_id: Option<String>,
}

impl StepCreateVolume {
    pub fn new(config: &ChrootConfig) -> Self {
        Self {
            from_scratch: config.from_scratch,
            root_volume_size: config.root_volume_size,
            root_volume_type: config.root_volume_type.clone(),
            root_volume_tags: config.root_volume_tags.clone(),
            encrypted: config.root_volume_encrypt_boot,
            kms_key_id: config.root_volume_kms_key_id.clone(),
            volume_id: None,
        }
    }

    fn request(&self, state: &mut BuildState) -> Result<CreateVolumeRequest> {
        let availability_zone = state
            .host_instance()?
            .availability_zone
            .clone()
            .ok_or(CloudError::MissingState("host_instance.availability_zone"))?;
        let tags = state.names.render_tags(&self.root_volume_tags)?;

        let mut request = CreateVolumeRequest {
            availability_zone,
            size: self.root_volume_size,
            volume_type: self.root_volume_type.clone(),
            encrypted: self.encrypted,
            kms_key_id: self.kms_key_id.clone(),
            tags,
            ..Default::default()
        };
        if self.from_scratch {
            return Ok(request);
        }

        let image = state.source_image()?;
        let root = image
            .root_mapping()
            .and_then(|m| m.ebs.as_ref())
            .ok_or_else(|| {
                CloudError::InvalidConfig(format!("source AMI {} has no EBS root device", image.id))
            })?;
        request.snapshot_id = root.snapshot_id.clone();
        if request.volume_type.is_none() {
            request.volume_type = root.volume_type.clone();
        }
        match (self.root_volume_size, root.volume_size) {
            (Some(wanted), Some(source)) if wanted < source => {
                return Err(CloudError::InvalidConfig(format!(
                    "root_volume_size {} GiB is smaller than the source root volume ({} GiB)",
                    wanted, source
                )));
            }
            (None, source) => request.size = source,
            _ => {}
        }
        Ok(request)
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let request = self.request(state)?;
        let compute = state.clients.compute.clone();

        state.ui.say("Creating the root volume...");
        let volume_id = compute.create_volume(&request).await?;
        self.volume_id = Some(volume_id.clone());
        info!(volume = %volume_id, snapshot = ?request.snapshot_id, "Created volume");
        state.ui.message(&format!("Volume ID: {}", volume_id));

        state
            .waiter()
            .until_state(cancel, "volume to become available", "available", &["error"], || async {
                Ok(compute.describe_volume(&volume_id).await?.state.as_str().to_string())
            })
            .await?;
        state.volume_id = Some(volume_id);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepCreateVolume {
    fn name(&self) -> &'static str {
        "create_volume"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let Some(volume_id) = self.volume_id.take() else {
            return Ok(());
        };
        state.ui.say("Deleting the created EBS volume...");
        let result = ignore_not_found(state.clients.compute.delete_volume(&volume_id).await);
        if let Err(e) = &result {
            warn!(volume = %volume_id, error = %e, "Failed to delete volume");
            state
                .ui
                .error(&format!("Error deleting EBS volume {}: {}", volume_id, e));
        }
        state.volume_id = None;
        result
    }
}

/// Wait until the volume reports no attachment
async fn wait_detached(
    cancel: &CancellationToken,
    waiter: Waiter,
    compute: &dyn ComputeApi,
    volume_id: &str,
) -> Result<()> {
    waiter
        .until_state(cancel, "volume to detach", "available", &["error"], || async {
            match compute.describe_volume(volume_id).await {
                Ok(volume) => Ok(volume.state.as_str().to_string()),
                Err(e) if e.is_not_found() => Ok("available".to_string()),
                Err(e) => Err(e),
            }
        })
        .await
}

/// Attach the volume to the build host
pub struct StepAttachVolume {
    attached: Option<String>,
}

impl StepAttachVolume {
    pub fn new() -> Self {
        Self { attached: None }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let volume_id = state.volume_id()?.to_string();
        let instance_id = state.host_instance()?.id.clone();
        let device = state.attach_device()?.to_string();
        let compute = state.clients.compute.clone();

        state
            .ui
            .say(&format!("Attaching the root volume to {}", device));
        compute.attach_volume(&volume_id, &instance_id, &device).await?;
        self.attached = Some(volume_id.clone());

        state
            .waiter()
            .until_state(cancel, "volume to attach", "attached", &[], || async {
                Ok(compute
                    .describe_volume(&volume_id)
                    .await?
                    .attachment_state()
                    .to_string())
            })
            .await
    }
}

impl Default for StepAttachVolume {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step<BuildState> for StepAttachVolume {
    fn name(&self) -> &'static str {
        "attach_volume"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let Some(volume_id) = self.attached.take() else {
            return Ok(());
        };
        state.ui.say("Detaching EBS volume...");
        let compute = state.clients.compute.clone();
        let result = match ignore_not_found(compute.detach_volume(&volume_id).await) {
            Ok(()) => {
                let cancel = CancellationToken::new();
                wait_detached(&cancel, state.waiter(), compute.as_ref(), &volume_id).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(volume = %volume_id, error = %e, "Failed to detach volume");
            state
                .ui
                .error(&format!("Error detaching EBS volume {}: {}", volume_id, e));
        }
        result
    }
}
