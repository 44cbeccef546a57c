use super::{finish, first_error, ignore_not_found, keep_first};
use crate::state::BuildState;
use amiflow_cloud::{
    CancellationToken, CloudError, ComputeApi, MultiError, Result, Step, StepAction, Waiter,
};
use amiflow_config::{BlockDevice, RootDeviceConfig};
use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{info, warn};

async fn wait_snapshot(
    cancel: &CancellationToken,
    waiter: Waiter,
    compute: &dyn ComputeApi,
    snapshot_id: &str,
) -> Result<()> {
    waiter
        .until_state(cancel, "snapshot to complete", "completed", &["error"], || async {
            Ok(compute.describe_snapshot(snapshot_id).await?.state.as_str().to_string())
        })
        .await
}

/// Snapshot a volume and wait for it to complete
///
/// The snapshot id is returned alongside a failed wait so the caller can
/// still remove it.
async fn snapshot_volume(
    cancel: &CancellationToken,
    waiter: Waiter,
    compute: &dyn ComputeApi,
    volume_id: &str,
    description: &str,
) -> (Option<String>, Result<()>) {
    match compute.create_snapshot(volume_id, description, &[]).await {
        Ok(snapshot_id) => {
            let waited = wait_snapshot(cancel, waiter, compute, &snapshot_id).await;
            (Some(snapshot_id), waited)
        }
        Err(e) => (None, Err(e)),
    }
}

async fn delete_snapshots(state: &BuildState, snapshots: &[String]) -> Result<()> {
    let mut first = None;
    for snapshot in snapshots {
        let result = ignore_not_found(state.clients.compute.delete_snapshot(snapshot).await);
        if let Err(e) = &result {
            warn!(snapshot = %snapshot, error = %e, "Failed to delete snapshot");
            state
                .ui
                .error(&format!("Error deleting snapshot {}: {}", snapshot, e));
        }
        keep_first(&mut first, result);
    }
    first_error(first)
}

/// Snapshot the chroot volume
pub struct StepSnapshot {
    snapshot_id: Option<String>,
}

impl StepSnapshot {
    pub fn new() -> Self {
        Self { snapshot_id: None }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let volume_id = state.volume_id()?.to_string();
        let description = format!("amiflow: {}", state.ami_name()?);
        let compute = state.clients.compute.clone();

        state.ui.say("Creating snapshot...");
        let snapshot_id = compute.create_snapshot(&volume_id, &description, &[]).await?;
        self.snapshot_id = Some(snapshot_id.clone());
        wait_snapshot(cancel, state.waiter(), compute.as_ref(), &snapshot_id).await?;
        info!(snapshot = %snapshot_id, volume = %volume_id, "Snapshot completed");
        state.ui.message(&format!("Snapshot ID: {}", snapshot_id));
        state.root_snapshot = Some(snapshot_id);
        Ok(())
    }
}

impl Default for StepSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step<BuildState> for StepSnapshot {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        if !state.is_aborted() {
            return Ok(());
        }
        let Some(snapshot_id) = self.snapshot_id.take() else {
            return Ok(());
        };
        state.ui.say("Removing snapshot since we cancelled or halted...");
        delete_snapshots(state, &[snapshot_id]).await
    }
}

/// Snapshot every launch volume the image keeps, concurrently
pub struct StepSnapshotVolumes {
    devices: Vec<String>,
    created: Vec<String>,
}

impl StepSnapshotVolumes {
    /// Launch devices that are also image mappings, plus the root source device
    pub fn new(
        launch_mappings: &[BlockDevice],
        ami_mappings: &[BlockDevice],
        root: &RootDeviceConfig,
    ) -> Self {
        let devices = launch_mappings
            .iter()
            .map(|d| d.device_name.clone())
            .filter(|name| {
                *name == root.source_device_name
                    || ami_mappings.iter().any(|a| a.device_name == *name)
            })
            .collect();
        Self {
            devices,
            created: Vec::new(),
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let instance = state.instance()?.clone();
        let description = format!("amiflow: {}", state.ami_name()?);
        let compute = state.clients.compute.clone();
        let waiter = state.waiter();

        let mut volumes = Vec::new();
        for device in &self.devices {
            let volume_id = instance.volume_at(device).ok_or_else(|| {
                CloudError::ResourceNotFound(format!(
                    "no volume attached at {} on instance {}",
                    device, instance.id
                ))
            })?;
            volumes.push((device.clone(), volume_id.to_string()));
        }

        state.ui.say(&format!("Snapshotting {} volumes...", volumes.len()));
        let results = join_all(volumes.iter().map(|(device, volume_id)| {
            let compute = compute.clone();
            let description = &description;
            async move {
                let (snapshot_id, waited) =
                    snapshot_volume(cancel, waiter, compute.as_ref(), volume_id, description).await;
                (device.clone(), snapshot_id, waited)
            }
        }))
        .await;

        let mut errors = MultiError::new();
        for (device, snapshot_id, waited) in results {
            if let Some(snapshot_id) = &snapshot_id {
                self.created.push(snapshot_id.clone());
            }
            match (snapshot_id, waited) {
                (Some(snapshot_id), Ok(())) => {
                    state
                        .ui
                        .message(&format!("Snapshot of {}: {}", device, snapshot_id));
                    state.volume_snapshots.insert(device, snapshot_id);
                }
                (_, Err(e)) => errors.push(e),
                (None, Ok(())) => {}
            }
        }
        errors.into_result()
    }
}

#[async_trait]
impl Step<BuildState> for StepSnapshotVolumes {
    fn name(&self) -> &'static str {
        "snapshot_volumes"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        if !state.is_aborted() || self.created.is_empty() {
            return Ok(());
        }
        let created = std::mem::take(&mut self.created);
        state.ui.say("Removing snapshots since we cancelled or halted...");
        delete_snapshots(state, &created).await
    }
}

/// Move the surrogate volume into the root device slot
///
/// The original root volume is detached and deleted during cleanup.
pub struct StepSwapVolumes {
    root: RootDeviceConfig,
    original_root: Option<String>,
}

impl StepSwapVolumes {
    pub fn new(root: RootDeviceConfig) -> Self {
        Self {
            root,
            original_root: None,
        }
    }

    async fn detach(
        &self,
        cancel: &CancellationToken,
        state: &BuildState,
        volume_id: &str,
    ) -> Result<()> {
        let compute = state.clients.compute.as_ref();
        compute.detach_volume(volume_id).await?;
        state
            .waiter()
            .until_state(cancel, "volume to detach", "available", &["error"], || async {
                Ok(compute.describe_volume(volume_id).await?.state.as_str().to_string())
            })
            .await
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let instance = state.instance()?.clone();
        let root_device = instance
            .root_device_name
            .clone()
            .unwrap_or_else(|| self.root.device_name.clone());
        let original = instance.volume_at(&root_device).map(str::to_string);
        let surrogate = instance
            .volume_at(&self.root.source_device_name)
            .map(str::to_string)
            .ok_or_else(|| {
                CloudError::ResourceNotFound(format!(
                    "no volume attached at {}",
                    self.root.source_device_name
                ))
            })?;

        state.ui.say("Swapping the surrogate volume in as the root device...");
        if let Some(original) = original {
            self.detach(cancel, state, &original).await?;
            self.original_root = Some(original);
        }
        self.detach(cancel, state, &surrogate).await?;

        let compute = state.clients.compute.clone();
        compute
            .attach_volume(&surrogate, &instance.id, &self.root.device_name)
            .await?;
        state
            .waiter()
            .until_state(cancel, "volume to attach", "attached", &[], || async {
                Ok(compute
                    .describe_volume(&surrogate)
                    .await?
                    .attachment_state()
                    .to_string())
            })
            .await?;
        state.instance = Some(compute.describe_instance(&instance.id).await?);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepSwapVolumes {
    fn name(&self) -> &'static str {
        "swap_volumes"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let Some(volume_id) = self.original_root.take() else {
            return Ok(());
        };
        // Detached volumes outlive the instance
        let result = ignore_not_found(state.clients.compute.delete_volume(&volume_id).await);
        if let Err(e) = &result {
            state
                .ui
                .error(&format!("Error deleting original root volume {}: {}", volume_id, e));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_state;
    use amiflow_cloud::fake::FakeCloud;
    use amiflow_cloud::{
        BlockDeviceMapping, EbsBlockDevice, Image, Instance, PipelineState, RunInstanceRequest,
    };

    fn ebs(device: &str, size: i32) -> BlockDeviceMapping {
        BlockDeviceMapping {
            device_name: device.into(),
            ebs: Some(EbsBlockDevice {
                volume_size: Some(size),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn surrogate_instance(cloud: &FakeCloud) -> Instance {
        let image = cloud.seed_image(Image {
            root_device_name: Some("/dev/xvda".into()),
            block_device_mappings: vec![ebs("/dev/xvda", 8)],
            ..Default::default()
        });
        let id = cloud
            .run_instance(&RunInstanceRequest {
                image_id: image,
                instance_type: "m5.large".into(),
                block_device_mappings: vec![ebs("/dev/xvdf", 10), ebs("/dev/xvdg", 20)],
                ..Default::default()
            })
            .await
            .unwrap();
        cloud.instance(&id).unwrap()
    }

    fn root() -> RootDeviceConfig {
        RootDeviceConfig {
            source_device_name: "/dev/xvdf".into(),
            device_name: "/dev/xvda".into(),
            ..Default::default()
        }
    }

    fn launch(devices: &[&str]) -> Vec<BlockDevice> {
        devices
            .iter()
            .map(|d| BlockDevice {
                device_name: d.to_string(),
                volume_size: Some(10),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_only_kept_devices_are_snapshotted() {
        let step = StepSnapshotVolumes::new(
            &launch(&["/dev/xvdf", "/dev/xvdg", "/dev/xvdh"]),
            &launch(&["/dev/xvdg"]),
            &root(),
        );
        assert_eq!(step.devices, vec!["/dev/xvdf".to_string(), "/dev/xvdg".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_volumes_records_each_device() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.instance = Some(surrogate_instance(&cloud).await);
        state.ami_name = Some("surrogate".into());

        let mut step = StepSnapshotVolumes::new(
            &launch(&["/dev/xvdf", "/dev/xvdg"]),
            &launch(&["/dev/xvdg"]),
            &root(),
        );
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert_eq!(state.volume_snapshots.len(), 2);
        assert_eq!(cloud.count("CreateSnapshot"), 2);

        // Kept on success
        step.cleanup(&mut state).await.unwrap();
        assert!(state.volume_snapshots.values().all(|s| cloud.snapshot_exists(s)));

        state.mark_cancelled();
        step.cleanup(&mut state).await.unwrap();
        assert!(state.volume_snapshots.values().all(|s| !cloud.snapshot_exists(s)));
    }

    #[tokio::test]
    async fn test_missing_device_halts_before_snapshotting() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.instance = Some(surrogate_instance(&cloud).await);
        state.ami_name = Some("surrogate".into());

        let root = RootDeviceConfig {
            source_device_name: "/dev/xvdz".into(),
            device_name: "/dev/xvda".into(),
            ..Default::default()
        };
        let mut step = StepSnapshotVolumes::new(&launch(&["/dev/xvdz"]), &[], &root);
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Halt);
        assert_eq!(cloud.count("CreateSnapshot"), 0);
    }

    #[tokio::test]
    async fn test_swap_moves_surrogate_to_root() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let instance = surrogate_instance(&cloud).await;
        let original = instance.volume_at("/dev/xvda").unwrap().to_string();
        let surrogate = instance.volume_at("/dev/xvdf").unwrap().to_string();
        state.instance = Some(instance);

        let mut step = StepSwapVolumes::new(root());
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert_eq!(state.instance().unwrap().volume_at("/dev/xvda"), Some(surrogate.as_str()));
        assert_eq!(state.instance().unwrap().volume_at("/dev/xvdf"), None);

        step.cleanup(&mut state).await.unwrap();
        assert!(!cloud.volume_ids().contains(&original));
    }

    #[tokio::test]
    async fn test_chroot_snapshot_removed_when_wait_fails() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let volume = cloud
            .create_volume(&amiflow_cloud::CreateVolumeRequest {
                availability_zone: "us-east-1a".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        state.volume_id = Some(volume);
        state.ami_name = Some("chroot".into());
        cloud.fail_next("DescribeSnapshots", "InternalError", "boom", 1);

        let mut step = StepSnapshot::new();
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Halt);
        assert!(state.root_snapshot.is_none());
        let snapshot = step.snapshot_id.clone().unwrap();
        assert!(cloud.snapshot_exists(&snapshot));

        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        assert!(!cloud.snapshot_exists(&snapshot));
        assert_eq!(cloud.count("DeleteSnapshot"), 1);
    }

    #[tokio::test]
    async fn test_snapshot_volumes_removes_snapshot_whose_wait_failed() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.instance = Some(surrogate_instance(&cloud).await);
        state.ami_name = Some("surrogate".into());
        cloud.fail_next("DescribeSnapshots", "InternalError", "boom", 1);

        let mut step = StepSnapshotVolumes::new(
            &launch(&["/dev/xvdf", "/dev/xvdg"]),
            &launch(&["/dev/xvdg"]),
            &root(),
        );
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Halt);
        assert_eq!(cloud.count("CreateSnapshot"), 2);
        assert_eq!(step.created.len(), 2);
        assert_eq!(state.volume_snapshots.len(), 1);
        let created = step.created.clone();

        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        assert!(created.iter().all(|s| !cloud.snapshot_exists(s)));
    }

    #[tokio::test]
    async fn test_chroot_snapshot_removed_when_aborted() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let volume = cloud
            .create_volume(&amiflow_cloud::CreateVolumeRequest {
                availability_zone: "us-east-1a".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        state.volume_id = Some(volume);
        state.ami_name = Some("chroot".into());

        let mut step = StepSnapshot::new();
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let snapshot = state.root_snapshot().unwrap().to_string();
        assert!(cloud.calls_for("CreateSnapshot")[0].detail.ends_with("amiflow: chroot"));

        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        assert!(!cloud.snapshot_exists(&snapshot));
    }
}
