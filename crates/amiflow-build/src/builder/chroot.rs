use super::ebs::distribution_steps;
use super::{Builder, CHROOT_BUILDER_ID};
use crate::state::BuildState;
use crate::steps::{
    DEFAULT_LOCK_PATH, StepAttachVolume, StepCheckRootDevice, StepChrootProvision, StepCopyFiles,
    StepCreateVolume, StepDeregisterAmi, StepEarlyCleanup, StepFlock, StepInstanceInfo,
    StepMountDevice, StepMountExtra, StepPreValidate, StepPrepareDevice, StepRegisterChrootAmi,
    StepSnapshot, StepSourceAmiInfo,
};
use amiflow_cloud::{SharedStep, Step};
use amiflow_config::{ChrootConfig, Polling};
use std::path::PathBuf;

/// Overrides the lock file serialising device selection
pub const LOCK_PATH_ENV: &str = "AMIFLOW_CHROOT_LOCK";

/// Provision a volume attached to this host inside a chroot
pub struct ChrootBuilder {
    config: ChrootConfig,
    lock_path: PathBuf,
}

impl ChrootBuilder {
    pub fn new(config: ChrootConfig) -> Self {
        Self::with_lock_path(config, default_lock_path())
    }

    pub fn with_lock_path(config: ChrootConfig, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            lock_path: lock_path.into(),
        }
    }
}

/// `AMIFLOW_CHROOT_LOCK`, else the shared default
fn default_lock_path() -> PathBuf {
    std::env::var_os(LOCK_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_PATH))
}

impl Builder for ChrootBuilder {
    fn id(&self) -> &'static str {
        CHROOT_BUILDER_ID
    }

    fn polling(&self) -> Polling {
        self.config.access.polling()
    }

    fn prepare_state(&self, state: &mut BuildState) {
        state.command_wrapper = self.config.command_wrapper.clone();
    }

    fn steps(&self, commands: Vec<String>) -> Vec<Box<dyn Step<BuildState>>> {
        let config = &self.config;
        let ami = &config.ami;

        // Released early so other builds can pick a device while this one provisions
        let flock = SharedStep::new(StepFlock::new(self.lock_path.clone()));
        let attach = SharedStep::new(StepAttachVolume::new());
        let mount = SharedStep::new(StepMountDevice::new(config));
        let extra = SharedStep::new(StepMountExtra::new(config.chroot_mounts.clone()));
        let copy = SharedStep::new(StepCopyFiles::new(config.copy_files.clone()));

        let mut steps: Vec<Box<dyn Step<BuildState>>> = vec![
            Box::new(StepInstanceInfo),
            Box::new(StepPreValidate::new(
                ami.ami_name.clone(),
                ami.force_deregister,
                false,
            )),
        ];
        if !config.from_scratch {
            steps.push(Box::new(StepSourceAmiInfo::new(config.source.clone())));
        }
        steps.push(Box::new(StepCheckRootDevice::new(config.from_scratch)));
        steps.push(Box::new(flock.clone()));
        steps.push(Box::new(StepPrepareDevice::new(config.device_path.clone())));
        steps.push(Box::new(StepCreateVolume::new(config)));
        steps.push(Box::new(attach.clone()));
        steps.push(Box::new(StepEarlyCleanup::new(
            "early_unflock",
            vec![flock.clone()],
        )));
        steps.push(Box::new(mount.clone()));
        steps.push(Box::new(extra.clone()));
        steps.push(Box::new(copy.clone()));
        steps.push(Box::new(StepChrootProvision::new(commands)));
        // The volume must be unmounted and detached before it is snapshotted
        steps.push(Box::new(StepEarlyCleanup::new(
            "early_cleanup",
            vec![copy, extra, mount, attach],
        )));
        steps.push(Box::new(StepSnapshot::new()));
        steps.push(Box::new(StepDeregisterAmi::new(
            ami.force_deregister,
            ami.force_delete_snapshot,
            ami.ami_regions.clone(),
        )));
        steps.push(Box::new(StepRegisterChrootAmi::new(config)));
        steps.extend(distribution_steps(ami));
        steps
    }
}
