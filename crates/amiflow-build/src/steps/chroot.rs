use super::finish;
use crate::communicator::run_checked;
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, CloudError, Result, Step, StepAction};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info};

/// Default lock serialising device selection between concurrent chroot builds
pub const DEFAULT_LOCK_PATH: &str = "/var/lock/amiflow-chroot/lock";

/// Describe the EC2 instance this build runs on
pub struct StepInstanceInfo;

impl StepInstanceInfo {
    async fn execute(&self, state: &mut BuildState) -> Result<()> {
        state.ui.say("Gathering information about this EC2 instance...");
        let instance_id = state.clients.host.instance_id().await.map_err(|e| {
            CloudError::InvalidConfig(format!(
                "the chroot builder must run on an EC2 instance: {}",
                e
            ))
        })?;
        let instance = state.clients.compute.describe_instance(&instance_id).await?;
        info!(
            instance = %instance.id,
            zone = ?instance.availability_zone,
            "Found host instance"
        );
        state.host_instance = Some(instance);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepInstanceInfo {
    fn name(&self) -> &'static str {
        "instance_info"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}

/// The source image must boot from an EBS snapshot we can copy
pub struct StepCheckRootDevice {
    from_scratch: bool,
}

impl StepCheckRootDevice {
    pub fn new(from_scratch: bool) -> Self {
        Self { from_scratch }
    }

    fn check(&self, state: &BuildState) -> Result<()> {
        if self.from_scratch {
            return Ok(());
        }
        let image = state.source_image()?;
        if !image.is_ebs_backed() {
            return Err(CloudError::InvalidConfig(format!(
                "source AMI {} must be EBS-backed",
                image.id
            )));
        }
        match image.root_mapping().and_then(|m| m.snapshot_id()) {
            Some(_) => Ok(()),
            None => Err(CloudError::InvalidConfig(format!(
                "source AMI {} has no root device snapshot",
                image.id
            ))),
        }
    }
}

#[async_trait]
impl Step<BuildState> for StepCheckRootDevice {
    fn name(&self) -> &'static str {
        "check_root_device"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.check(state);
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}

/// Hold an exclusive file lock while a device is picked and attached
pub struct StepFlock {
    path: PathBuf,
    file: Option<File>,
}

impl StepFlock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    async fn execute(&mut self, state: &mut BuildState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;

        state
            .ui
            .say(&format!("Waiting for lock on {}...", self.path.display()));
        let file = tokio::task::spawn_blocking(move || file.lock().map(|()| file))
            .await
            .map_err(std::io::Error::other)??;
        debug!(path = %self.path.display(), "Lock acquired");
        self.file = Some(file);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepFlock {
    fn name(&self) -> &'static str {
        "flock"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        if let Some(file) = self.file.take() {
            debug!(path = %self.path.display(), "Releasing lock");
            file.unlock()?;
        }
        Ok(())
    }
}

/// Pick the device the new volume is attached as
pub struct StepPrepareDevice {
    device_path: Option<String>,
}

impl StepPrepareDevice {
    pub fn new(device_path: Option<String>) -> Self {
        Self { device_path }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<()> {
        let (attach, local) = match &self.device_path {
            Some(path) => (path.clone(), path.clone()),
            None => {
                let listing = run_checked(state.host_shell.as_ref(), "ls -1 /dev").await?;
                free_device(&listing)?
            }
        };
        state.ui.say(&format!("Device: {}", local));
        state.attach_device = Some(attach);
        state.local_device = Some(local);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepPrepareDevice {
    fn name(&self) -> &'static str {
        "prepare_device"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}

/// First of `/dev/sd[f-p]` with no existing `sd` or `xvd` node
///
/// Returns the name to attach as and the name the host kernel will expose.
/// Xen hosts rename `sdX` to `xvdX`.
pub(crate) fn free_device(listing: &str) -> Result<(String, String)> {
    let present: BTreeSet<&str> = listing.lines().map(str::trim).collect();
    let xen = present.iter().any(|name| name.starts_with("xvd"));

    for letter in 'f'..='p' {
        let sd = format!("sd{}", letter);
        let xvd = format!("xvd{}", letter);
        if present.contains(sd.as_str()) || present.contains(xvd.as_str()) {
            continue;
        }
        let local = if xen { xvd } else { sd.clone() };
        return Ok((format!("/dev/{}", sd), format!("/dev/{}", local)));
    }
    Err(CloudError::ResourceNotFound(
        "no free device path between /dev/sdf and /dev/sdp".to_string(),
    ))
}
