use super::ebs::{distribution_steps, instance_steps};
use super::{Builder, SURROGATE_BUILDER_ID};
use crate::state::BuildState;
use crate::steps::{
    StepCreateAmi, StepDeregisterAmi, StepRegisterSurrogateAmi, StepSnapshotVolumes,
    StepSwapVolumes,
};
use amiflow_cloud::Step;
use amiflow_config::{Polling, SurrogateConfig};

/// Provision a secondary volume and register an image with it as root
pub struct SurrogateBuilder {
    config: SurrogateConfig,
}

impl SurrogateBuilder {
    pub fn new(config: SurrogateConfig) -> Self {
        Self { config }
    }
}

impl Builder for SurrogateBuilder {
    fn id(&self) -> &'static str {
        SURROGATE_BUILDER_ID
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
            false,
            commands,
        );
        steps.push(Box::new(StepDeregisterAmi::new(
            config.ami.force_deregister,
            config.ami.force_delete_snapshot,
            config.ami.ami_regions.clone(),
        )));

        if config.use_create_image {
            steps.push(Box::new(StepSwapVolumes::new(config.ami_root_device.clone())));
            steps.push(Box::new(StepCreateAmi::new(
                config.ami.ami_description.clone(),
                config.ami_block_device_mappings.clone(),
            )));
        } else {
            steps.push(Box::new(StepSnapshotVolumes::new(
                &config.launch_block_device_mappings,
                &config.ami_block_device_mappings,
                &config.ami_root_device,
            )));
            steps.push(Box::new(StepRegisterSurrogateAmi::new(config)));
        }
        steps.extend(distribution_steps(&config.ami));
        steps
    }
}
