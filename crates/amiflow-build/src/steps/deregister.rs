use super::{delete_image, finish};
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, ImageQuery, Result, Step, StepAction};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::info;

/// Remove images that already carry the target name when forced to
pub struct StepDeregisterAmi {
    force_deregister: bool,
    force_delete_snapshot: bool,
    regions: Vec<String>,
}

impl StepDeregisterAmi {
    pub fn new(force_deregister: bool, force_delete_snapshot: bool, regions: Vec<String>) -> Self {
        Self {
            force_deregister,
            force_delete_snapshot,
            regions,
        }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        if !self.force_deregister {
            return Ok(());
        }
        let name = state.ami_name()?.to_string();

        let mut regions: BTreeSet<String> = self.regions.iter().cloned().collect();
        regions.insert(state.region().to_string());

        for region in regions {
            let compute = state.clients.regions.compute(&region).await?;
            let query = ImageQuery {
                owners: vec!["self".to_string()],
                ..ImageQuery::by_name(name.clone())
            };
            for image in compute.describe_images(&query).await? {
                state.ui.say(&format!(
                    "Deregistered AMI {} ({}) in {}",
                    image.name, image.id, region
                ));
                let snapshots = if self.force_delete_snapshot {
                    image.snapshot_ids()
                } else {
                    Vec::new()
                };
                delete_image(cancel, compute.as_ref(), &image.id, &snapshots).await?;
                info!(image = %image.id, region = %region, "Deregistered existing image");
                for snapshot in snapshots {
                    state.ui.message(&format!("Deleted snapshot {}", snapshot));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepDeregisterAmi {
    fn name(&self) -> &'static str {
        "deregister_ami"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}
