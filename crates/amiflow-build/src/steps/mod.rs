//! Build steps
//!
//! Each step owns the identifiers of what it created and releases exactly
//! those in `cleanup`. Steps that produce images only remove them when the
//! build was cancelled or halted.

mod chroot;
mod create_ami;
mod create_tags;
mod deregister;
mod instance_profile;
mod key_pair;
mod modify_attributes;
mod mount;
mod prevalidate;
mod protection;
mod provision;
mod region_copy;
mod register;
mod run_instance;
mod security_group;
mod snapshot;
mod source;
mod stop_instance;
mod volume;

pub use chroot::{
    DEFAULT_LOCK_PATH, StepCheckRootDevice, StepFlock, StepInstanceInfo, StepPrepareDevice,
};
pub use create_ami::StepCreateAmi;
pub use create_tags::StepCreateTags;
pub use deregister::StepDeregisterAmi;
pub use instance_profile::StepInstanceProfile;
pub use key_pair::StepKeyPair;
pub use modify_attributes::StepModifyAmiAttributes;
pub use mount::{
    StepChrootProvision, StepCopyFiles, StepEarlyCleanup, StepMountDevice, StepMountExtra,
};
pub use prevalidate::StepPreValidate;
pub use protection::{StepEnableFastLaunch, StepImageProtection};
pub use provision::{StepConnect, StepProvision};
pub use region_copy::{StepAmiRegionCopy, dedup_regions};
pub use register::{StepRegisterChrootAmi, StepRegisterSurrogateAmi};
pub use run_instance::StepRunSourceInstance;
pub use security_group::StepSecurityGroup;
pub use snapshot::{StepSnapshot, StepSnapshotVolumes, StepSwapVolumes};
pub use source::StepSourceAmiInfo;
pub use stop_instance::StepStopInstance;
pub use volume::{StepAttachVolume, StepCreateVolume};

use crate::state::BuildState;
use amiflow_cloud::{
    BlockDeviceMapping, CancellationToken, CloudError, ComputeApi, EbsBlockDevice, Result, Retry,
    StepAction,
};
use amiflow_config::BlockDevice;
use tracing::warn;

pub(crate) fn finish(result: Result<()>, state: &mut BuildState) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(e) => state.halt(e),
    }
}

/// Treat a not-found answer as already cleaned up
pub(crate) fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Keep the first error of a multi-part cleanup while still attempting the rest
pub(crate) fn keep_first(first: &mut Option<CloudError>, result: Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "Cleanup action failed");
        if first.is_none() {
            *first = Some(e);
        }
    }
}

/// Drop the build region's image record while it still names `image_id`
///
/// An encrypted region copy may have replaced it; that entry stays.
pub(crate) fn forget_image(state: &mut BuildState, image_id: &str) {
    let region = state.region().to_string();
    if state.amis.get(&region).is_some_and(|id| id == image_id) {
        state.amis.remove(&region);
        state.snapshots.remove(&region);
    }
}

pub(crate) fn first_error(first: Option<CloudError>) -> Result<()> {
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub(crate) fn to_mapping(device: &BlockDevice) -> BlockDeviceMapping {
    let ebs = device.is_ebs().then(|| EbsBlockDevice {
        snapshot_id: device.snapshot_id.clone(),
        volume_size: device.volume_size,
        volume_type: device.volume_type.clone(),
        iops: device.iops,
        throughput: device.throughput,
        delete_on_termination: device.delete_on_termination,
        encrypted: device.encrypted,
        kms_key_id: device.kms_key_id.clone(),
    });
    BlockDeviceMapping {
        device_name: device.device_name.clone(),
        virtual_name: device.virtual_name.clone(),
        no_device: device.no_device,
        ebs,
    }
}

pub(crate) fn to_mappings(devices: &[BlockDevice]) -> Vec<BlockDeviceMapping> {
    devices.iter().map(to_mapping).collect()
}

/// Deregister an image and delete its snapshots, tolerating what is already gone
pub(crate) async fn delete_image(
    cancel: &CancellationToken,
    compute: &dyn ComputeApi,
    image_id: &str,
    snapshot_ids: &[String],
) -> Result<()> {
    ignore_not_found(compute.deregister_image(image_id).await)?;
    // Snapshots stay in use until the deregistration settles
    let retry = Retry::new(10)
        .retry_if(|e| e.is_code(&["InvalidSnapshot.InUse"]) || e.is_throttled());
    for snapshot in snapshot_ids {
        ignore_not_found(retry.run(cancel, || compute.delete_snapshot(snapshot)).await)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_state(cloud: &amiflow_cloud::fake::FakeCloud) -> BuildState {
    use std::sync::Arc;
    use std::time::Duration;

    BuildState::new(
        cloud.clients(),
        Arc::new(amiflow_cloud::BufferUi::new()),
        amiflow_config::Polling {
            delay: Duration::from_secs(1),
            max_attempts: 3,
        },
        Arc::new(crate::communicator::LocalShell),
    )
}

/// Host shell for tests: records commands and answers `ls -1 /dev`
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingShell {
    pub commands: std::sync::Mutex<Vec<String>>,
    pub devices: String,
    pub fail_on: Option<String>,
}

#[cfg(test)]
impl RecordingShell {
    pub fn with_devices(devices: &str) -> Self {
        Self {
            devices: devices.to_string(),
            ..Default::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl crate::communicator::Communicator for RecordingShell {
    async fn run(&self, command: &str) -> Result<crate::communicator::CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        if self.fail_on.as_deref().is_some_and(|f| command.contains(f)) {
            return Ok(crate::communicator::CommandOutput {
                exit_code: 1,
                stderr: "failed".to_string(),
                ..Default::default()
            });
        }
        let stdout = if command == "ls -1 /dev" {
            self.devices.clone()
        } else {
            String::new()
        };
        Ok(crate::communicator::CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }
}
