use super::{delete_image, finish, forget_image, to_mapping, to_mappings};
use crate::state::BuildState;
use amiflow_cloud::{
    BlockDeviceMapping, CancellationToken, CloudError, EbsBlockDevice, Image, RegisterImageRequest,
    Result, Step, StepAction,
};
use amiflow_config::{AmiConfig, BlockDevice, ChrootConfig, RootDeviceConfig, SurrogateConfig};
use async_trait::async_trait;
use tracing::{info, warn};

/// Image-wide fields of a registration, before block devices
struct ImageSettings {
    description: Option<String>,
    architecture: String,
    virtualization_type: Option<String>,
    ena_support: Option<bool>,
    sriov_support: bool,
    boot_mode: Option<String>,
    imds_support: Option<String>,
}

impl ImageSettings {
    fn new(ami: &AmiConfig, architecture: &str, boot_mode: &Option<String>) -> Self {
        Self {
            description: ami.ami_description.clone(),
            architecture: architecture.to_string(),
            virtualization_type: ami.ami_virtualization_type.clone(),
            ena_support: ami.ena_support,
            sriov_support: ami.sriov_support,
            boot_mode: boot_mode.clone(),
            imds_support: ami.imds_support.clone(),
        }
    }

    /// Fill what the template leaves open from the source image
    fn request(
        &self,
        state: &mut BuildState,
        source: Option<&Image>,
        root_device_name: String,
        block_device_mappings: Vec<BlockDeviceMapping>,
    ) -> Result<RegisterImageRequest> {
        let description = match &self.description {
            Some(template) => Some(state.names.render(template)?),
            None => None,
        };
        let inherit = |own: Option<String>, from: fn(&Image) -> Option<String>| {
            own.or_else(|| source.and_then(from))
        };
        Ok(RegisterImageRequest {
            name: state.ami_name()?.to_string(),
            description,
            architecture: source
                .and_then(|i| i.architecture.clone())
                .or_else(|| Some(self.architecture.clone())),
            virtualization_type: inherit(self.virtualization_type.clone(), |i| {
                i.virtualization_type.clone()
            }),
            root_device_name,
            block_device_mappings,
            ena_support: self.ena_support.or_else(|| source.and_then(|i| i.ena_support)),
            sriov_net_support: if self.sriov_support {
                Some("simple".to_string())
            } else {
                source.and_then(|i| i.sriov_net_support.clone())
            },
            boot_mode: inherit(self.boot_mode.clone(), |i| i.boot_mode.clone()),
            imds_support: self.imds_support.clone(),
        })
    }
}

/// Register, wait for `available`, record the image for the build region
async fn register(
    cancel: &CancellationToken,
    state: &mut BuildState,
    request: &RegisterImageRequest,
    created: &mut Option<String>,
) -> Result<()> {
    let compute = state.clients.compute.clone();
    state.ui.say(&format!("Registering the AMI {}...", request.name));
    let image_id = compute.register_image(request).await?;
    *created = Some(image_id.clone());
    state.ui.message(&format!("AMI: {}", image_id));

    state.ui.say("Waiting for AMI to become ready...");
    state
        .waiter()
        .tolerate_not_found()
        .until_state(
            cancel,
            "AMI to become available",
            "available",
            &["failed", "error", "invalid"],
            || async { Ok(compute.describe_image(&image_id).await?.state.as_str().to_string()) },
        )
        .await?;

    let image = compute.describe_image(&image_id).await?;
    info!(image = %image_id, "Registered image");
    let region = state.region().to_string();
    state.snapshots.insert(region.clone(), image.snapshot_ids());
    state.amis.insert(region, image_id);
    Ok(())
}

/// Deregister the image of an aborted build; the snapshot steps own the snapshots
async fn deregister(state: &mut BuildState, created: &mut Option<String>) -> Result<()> {
    if !state.is_aborted() {
        return Ok(());
    }
    let Some(image_id) = created.take() else {
        return Ok(());
    };
    state.ui.say("Deregistering the AMI because of cancellation or error...");
    let compute = state.clients.compute.clone();
    let result = delete_image(&CancellationToken::new(), compute.as_ref(), &image_id, &[]).await;
    if let Err(e) = &result {
        warn!(image = %image_id, error = %e, "Failed to deregister image");
        state
            .ui
            .error(&format!("Error deregistering AMI {}: {}", image_id, e));
    }
    forget_image(state, &image_id);
    result
}

fn point_root_at(
    mapping: &mut BlockDeviceMapping,
    snapshot_id: &str,
    size: Option<i32>,
    volume_type: &Option<String>,
) {
    let ebs = mapping.ebs.get_or_insert_with(EbsBlockDevice::default);
    ebs.snapshot_id = Some(snapshot_id.to_string());
    // The new snapshot carries its own encryption
    ebs.encrypted = None;
    ebs.kms_key_id = None;
    if size.is_some() {
        ebs.volume_size = size;
    }
    if volume_type.is_some() {
        ebs.volume_type = volume_type.clone();
    }
}

/// Register the chroot snapshot as a new image
pub struct StepRegisterChrootAmi {
    settings: ImageSettings,
    from_scratch: bool,
    root_device_name: Option<String>,
    root_volume_size: Option<i32>,
    root_volume_type: Option<String>,
    ami_mappings: Vec<BlockDevice>,
    created: Option<String>,
}

impl StepRegisterChrootAmi {
    pub fn new(config: &ChrootConfig) -> Self {
        Self {
            settings: ImageSettings::new(&config.ami, &config.ami_architecture, &config.boot_mode),
            from_scratch: config.from_scratch,
            root_device_name: config.root_device_name.clone(),
            root_volume_size: config.root_volume_size,
            root_volume_type: config.root_volume_type.clone(),
            ami_mappings: config.ami_block_device_mappings.clone(),
            created: None,
        }
    }

    fn mappings(
        &self,
        source: Option<&Image>,
        root: &str,
        snapshot_id: &str,
    ) -> Vec<BlockDeviceMapping> {
        let mut mappings = if self.from_scratch || !self.ami_mappings.is_empty() {
            to_mappings(&self.ami_mappings)
        } else {
            source.map(|i| i.block_device_mappings.clone()).unwrap_or_default()
        };
        let size = self.root_volume_size;
        let volume_type = &self.root_volume_type;
        match mappings.iter_mut().find(|m| m.device_name == root) {
            Some(mapping) => point_root_at(mapping, snapshot_id, size, volume_type),
            None => {
                let mut mapping = BlockDeviceMapping {
                    device_name: root.to_string(),
                    ..Default::default()
                };
                point_root_at(&mut mapping, snapshot_id, size, volume_type);
                mappings.insert(0, mapping);
            }
        }
        mappings
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let snapshot_id = state.root_snapshot()?.to_string();
        let source = if self.from_scratch {
            None
        } else {
            Some(state.source_image()?.clone())
        };
        let root = self
            .root_device_name
            .clone()
            .or_else(|| source.as_ref().and_then(|i| i.root_device_name.clone()))
            .ok_or_else(|| CloudError::InvalidConfig("root_device_name is required".to_string()))?;

        let mappings = self.mappings(source.as_ref(), &root, &snapshot_id);
        let request = self.settings.request(state, source.as_ref(), root, mappings)?;
        register(cancel, state, &request, &mut self.created).await
    }
}

#[async_trait]
impl Step<BuildState> for StepRegisterChrootAmi {
    fn name(&self) -> &'static str {
        "register_ami"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        deregister(state, &mut self.created).await
    }
}

/// Register the surrogate snapshots, promoting one to the root device
pub struct StepRegisterSurrogateAmi {
    settings: ImageSettings,
    root: RootDeviceConfig,
    ami_mappings: Vec<BlockDevice>,
    created: Option<String>,
}

impl StepRegisterSurrogateAmi {
    pub fn new(config: &SurrogateConfig) -> Self {
        Self {
            settings: ImageSettings::new(&config.ami, &config.ami_architecture, &config.boot_mode),
            root: config.ami_root_device.clone(),
            ami_mappings: config.ami_block_device_mappings.clone(),
            created: None,
        }
    }

    fn mappings(&self, state: &BuildState) -> Result<Vec<BlockDeviceMapping>> {
        let root_snapshot = state
            .volume_snapshots
            .get(&self.root.source_device_name)
            .ok_or(CloudError::MissingState("volume_snapshots"))?;

        let mut mappings = vec![BlockDeviceMapping {
            device_name: self.root.device_name.clone(),
            ebs: Some(EbsBlockDevice {
                snapshot_id: Some(root_snapshot.clone()),
                volume_size: self.root.volume_size,
                volume_type: self.root.volume_type.clone(),
                iops: self.root.iops,
                throughput: self.root.throughput,
                delete_on_termination: Some(self.root.delete_on_termination),
                ..Default::default()
            }),
            ..Default::default()
        }];
        for device in &self.ami_mappings {
            if device.device_name == self.root.device_name {
                continue;
            }
            let mut mapping = to_mapping(device);
            if let Some(snapshot) = state.volume_snapshots.get(&device.device_name) {
                if let Some(ebs) = mapping.ebs.as_mut() {
                    ebs.snapshot_id = Some(snapshot.clone());
                }
            }
            mappings.push(mapping);
        }
        Ok(mappings)
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let mappings = self.mappings(state)?;
        // The surrogate volume, not the launch image, defines this image
        let request = self
            .settings
            .request(state, None, self.root.device_name.clone(), mappings)?;
        register(cancel, state, &request, &mut self.created).await
    }
}

#[async_trait]
impl Step<BuildState> for StepRegisterSurrogateAmi {
    fn name(&self) -> &'static str {
        "register_ami"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        deregister(state, &mut self.created).await
    }
}
