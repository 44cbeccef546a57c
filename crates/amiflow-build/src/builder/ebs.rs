use super::{Builder, EBS_BUILDER_ID};
use crate::state::BuildState;
use crate::steps::{
    StepAmiRegionCopy, StepConnect, StepCreateAmi, StepCreateTags, StepDeregisterAmi,
    StepEnableFastLaunch, StepImageProtection, StepInstanceProfile, StepKeyPair,
    StepModifyAmiAttributes, StepPreValidate, StepProvision, StepRunSourceInstance,
    StepSecurityGroup, StepSourceAmiInfo, StepStopInstance,
};
use amiflow_cloud::Step;
use amiflow_config::{AmiConfig, BlockDevice, EbsConfig, Polling, RunConfig};

/// Launch an instance from the source image, provision it, image it
pub struct EbsBuilder {
    config: EbsConfig,
}

impl EbsBuilder {
    pub fn new(config: EbsConfig) -> Self {
        Self { config }
    }
}

/// Steps shared by every builder that boots a source instance
pub(super) fn instance_steps(
    ami: &AmiConfig,
    run: &RunConfig,
    launch_mappings: &[BlockDevice],
    skip_create_ami: bool,
    commands: Vec<String>,
) -> Vec<Box<dyn Step<BuildState>>> {
    vec![
        Box::new(StepPreValidate::new(
            ami.ami_name.clone(),
            ami.force_deregister,
            skip_create_ami,
        )),
        Box::new(StepSourceAmiInfo::new(run.source.clone())),
        Box::new(StepKeyPair::new(run.comm.clone())),
        Box::new(StepSecurityGroup::new(run.clone())),
        Box::new(StepInstanceProfile::new(run)),
        Box::new(StepRunSourceInstance::new(run.clone(), launch_mappings.to_vec())),
        Box::new(StepConnect::new(run.comm.clone())),
        Box::new(StepProvision::new(commands)),
        Box::new(StepStopInstance::new(run.disable_stop_instance)),
    ]
}

/// Steps that copy, share, tag and protect a registered image
pub(super) fn distribution_steps(ami: &AmiConfig) -> Vec<Box<dyn Step<BuildState>>> {
    vec![
        Box::new(StepAmiRegionCopy::new(ami.clone())),
        Box::new(StepModifyAmiAttributes::new(ami.clone())),
        Box::new(StepCreateTags::new(ami.tags.clone(), ami.snapshot_tags.clone())),
        Box::new(StepImageProtection::new(
            ami.deprecate_at(),
            ami.deregistration_protection.clone(),
        )),
        Box::new(StepEnableFastLaunch::new(ami.fast_launch.clone())),
    ]
}

impl Builder for EbsBuilder {
    fn id(&self) -> &'static str {
        EBS_BUILDER_ID
    }

    fn polling(&self) -> Polling {
        self.config.access.polling()
    }

    fn steps(&self, commands: Vec<String>) -> Vec<Box<dyn Step<BuildState>>> {
        let config = &self.config;
        let mut steps = instance_steps(
            &config.ami,
            &config.run,
            &config.launch_block_device_mappings,
            config.skip_create_ami,
            commands,
        );
        if config.skip_create_ami {
            return steps;
        }

        steps.push(Box::new(StepDeregisterAmi::new(
            config.ami.force_deregister,
            config.ami.force_delete_snapshot,
            config.ami.ami_regions.clone(),
        )));
        steps.push(Box::new(StepCreateAmi::new(
            config.ami.ami_description.clone(),
            config.ami_block_device_mappings.clone(),
        )));
        steps.extend(distribution_steps(&config.ami));
        steps
    }
}
