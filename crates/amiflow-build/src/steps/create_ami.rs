use super::{delete_image, finish, forget_image, to_mappings};
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, CreateImageRequest, Result, Retry, Step, StepAction};
use amiflow_config::BlockDevice;
use async_trait::async_trait;
use tracing::{info, warn};

/// Image the stopped source instance
pub struct StepCreateAmi {
    description: Option<String>,
    ami_mappings: Vec<BlockDevice>,
    created: Option<(String, Vec<String>)>,
}

impl StepCreateAmi {
    pub fn new(description: Option<String>, ami_mappings: Vec<BlockDevice>) -> Self {
        Self {
            description,
            ami_mappings,
            created: None,
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let instance_id = state.instance()?.id.clone();
        let name = state.ami_name()?.to_string();
        let description = match &self.description {
            Some(template) => Some(state.names.render(template)?),
            None => None,
        };
        let compute = state.clients.compute.clone();

        state.ui.say(&format!("Creating AMI {} from instance {}", name, instance_id));
        let request = CreateImageRequest {
            instance_id,
            name,
            description,
            block_device_mappings: to_mappings(&self.ami_mappings),
        };
        let image_id = Retry::new(5)
            .run(cancel, || compute.create_image(&request))
            .await?;
        self.created = Some((image_id.clone(), Vec::new()));
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
                || async {
                    let image = compute.describe_image(&image_id).await?;
                    Ok(image.state.as_str().to_string())
                },
            )
            .await?;

        let image = compute.describe_image(&image_id).await?;
        let snapshots = image.snapshot_ids();
        info!(image = %image_id, snapshots = ?snapshots, "Created image");
        self.created = Some((image_id.clone(), snapshots.clone()));

        let region = state.region().to_string();
        state.amis.insert(region.clone(), image_id);
        state.snapshots.insert(region, snapshots);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepCreateAmi {
    fn name(&self) -> &'static str {
        "create_ami"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        if !state.is_aborted() {
            return Ok(());
        }
        let Some((image_id, mut snapshots)) = self.created.take() else {
            return Ok(());
        };

        state
            .ui
            .say("Deregistering the AMI and deleting its snapshots because of cancellation or error...");
        let compute = state.clients.compute.clone();
        // The image was created but never described
        if snapshots.is_empty() {
            match compute.describe_image(&image_id).await {
                Ok(image) => snapshots = image.snapshot_ids(),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(image = %image_id, error = %e, "Failed to look up image snapshots");
                    state.ui.error(&format!(
                        "Could not list the snapshots of AMI {}: {}. Please check for leftovers.",
                        image_id, e
                    ));
                }
            }
        }
        let cancel = CancellationToken::new();
        let result = delete_image(&cancel, compute.as_ref(), &image_id, &snapshots).await;
        if let Err(e) = &result {
            warn!(image = %image_id, error = %e, "Failed to remove image");
            state.ui.error(&format!(
                "Error deregistering AMI {}: {}. Please delete it manually.",
                image_id, e
            ));
        }
        forget_image(state, &image_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_state;
    use amiflow_cloud::fake::FakeCloud;
    use amiflow_cloud::{
        BlockDeviceMapping, ComputeApi, EbsBlockDevice, Image, Instance, PipelineState,
        RunInstanceRequest,
    };

    async fn launched(cloud: &FakeCloud) -> Instance {
        let source = cloud.seed_image(Image {
            name: "base".into(),
            root_device_name: Some("/dev/xvda".into()),
            block_device_mappings: vec![BlockDeviceMapping {
                device_name: "/dev/xvda".into(),
                ebs: Some(EbsBlockDevice {
                    snapshot_id: Some("snap-base".into()),
                    volume_size: Some(8),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        let id = cloud
            .run_instance(&RunInstanceRequest {
                image_id: source,
                instance_type: "t3.micro".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        cloud.instance(&id).unwrap()
    }

    #[tokio::test]
    async fn test_image_recorded_for_build_region() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.instance = Some(launched(&cloud).await);
        state.ami_name = Some("golden".into());
        let mut step = StepCreateAmi::new(Some("built in {{ build_region }}".into()), Vec::new());

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let image_id = state.amis.get("us-east-1").cloned().unwrap();
        let image = cloud.image(&image_id).unwrap();
        assert_eq!(image.description.as_deref(), Some("built in us-east-1"));
        assert_eq!(state.snapshots["us-east-1"], image.snapshot_ids());

        // A successful build keeps its image
        step.cleanup(&mut state).await.unwrap();
        assert!(cloud.image(&image_id).is_some());
    }

    #[tokio::test]
    async fn test_aborted_build_removes_image() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.instance = Some(launched(&cloud).await);
        state.ami_name = Some("golden".into());
        let mut step = StepCreateAmi::new(None, Vec::new());

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let image_id = state.amis["us-east-1"].clone();
        let snapshots = state.snapshots["us-east-1"].clone();

        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        assert!(cloud.image(&image_id).is_none());
        assert!(snapshots.iter().all(|s| !cloud.snapshot_exists(s)));
        assert!(state.amis.is_empty());
    }

    #[tokio::test]
    async fn test_failed_wait_still_removes_image_snapshots() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.instance = Some(launched(&cloud).await);
        state.ami_name = Some("golden".into());
        cloud.fail_next("DescribeImages", "InternalError", "boom", 1);
        let mut step = StepCreateAmi::new(None, Vec::new());

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Halt);
        assert!(state.amis.is_empty());
        let (image_id, _) = step.created.clone().unwrap();
        let snapshots = cloud.image(&image_id).unwrap().snapshot_ids();
        assert!(!snapshots.is_empty());

        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        assert!(cloud.image(&image_id).is_none());
        assert!(snapshots.iter().all(|s| !cloud.snapshot_exists(s)));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_replacement_image_record() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.instance = Some(launched(&cloud).await);
        state.ami_name = Some("golden".into());
        let mut step = StepCreateAmi::new(None, Vec::new());

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let image_id = state.amis["us-east-1"].clone();
        // An encrypted copy took the build region's slot
        state.amis.insert("us-east-1".into(), "ami-encrypted".into());
        state.snapshots.insert("us-east-1".into(), vec!["snap-encrypted".into()]);

        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        assert!(cloud.image(&image_id).is_none());
        assert_eq!(state.amis["us-east-1"], "ami-encrypted");
        assert_eq!(state.snapshots["us-east-1"], vec!["snap-encrypted".to_string()]);
    }
}
