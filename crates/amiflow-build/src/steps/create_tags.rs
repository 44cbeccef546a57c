use super::finish;
use crate::state::BuildState;
use amiflow_cloud::{
    Backoff, CancellationToken, CloudError, Result, Retry, Step, StepAction, fan_out,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Tag the image and its snapshots in every region
pub struct StepCreateTags {
    tags: BTreeMap<String, String>,
    snapshot_tags: BTreeMap<String, String>,
}

impl StepCreateTags {
    pub fn new(tags: BTreeMap<String, String>, snapshot_tags: BTreeMap<String, String>) -> Self {
        Self {
            tags,
            snapshot_tags,
        }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        if self.tags.is_empty() && self.snapshot_tags.is_empty() {
            return Ok(());
        }
        let image_tags = state.names.render_tags(&self.tags)?;
        let snapshot_tags = state.names.render_tags(&self.snapshot_tags)?;

        let amis = state.amis.clone();
        let snapshots = state.snapshots.clone();
        let regions: Vec<String> = amis.keys().cloned().collect();
        let clients = state.clients.regions.clone();
        // Fresh images and snapshots are not always visible to the tagging API yet
        let retry = Retry::new(10)
            .backoff(Backoff::Constant(Duration::from_secs(3)))
            .retry_if(|e| e.is_not_found() || e.is_throttled());

        for (region, image) in &amis {
            state
                .ui
                .say(&format!("Adding tags to AMI ({}) in {}...", image, region));
        }
        let outcome = fan_out(&regions, |region| {
            let clients = clients.clone();
            let retry = &retry;
            let image_tags = &image_tags;
            let snapshot_tags = &snapshot_tags;
            let image_ids = vec![amis.get(&region).cloned().unwrap_or_default()];
            let snapshot_ids = snapshots.get(&region).cloned().unwrap_or_default();
            async move {
                let compute = clients.compute(&region).await?;
                if !image_tags.is_empty() {
                    retry
                        .run(cancel, || compute.create_tags(&image_ids, image_tags))
                        .await?;
                }
                if !snapshot_tags.is_empty() && !snapshot_ids.is_empty() {
                    retry
                        .run(cancel, || compute.create_tags(&snapshot_ids, snapshot_tags))
                        .await?;
                }
                Ok(())
            }
        })
        .await;

        if outcome.is_success() {
            Ok(())
        } else {
            Err(CloudError::Multi(outcome.errors))
        }
    }
}

#[async_trait]
impl Step<BuildState> for StepCreateTags {
    fn name(&self) -> &'static str {
        "create_tags"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_state;
    use amiflow_cloud::fake::FakeCloud;
    use amiflow_cloud::{BlockDeviceMapping, EbsBlockDevice, Image, Tag};

    fn image_with_snapshot(cloud: &FakeCloud, snapshot: &str) -> String {
        cloud.seed_image(Image {
            name: "golden".into(),
            block_device_mappings: vec![BlockDeviceMapping {
                device_name: "/dev/xvda".into(),
                ebs: Some(EbsBlockDevice {
                    snapshot_id: Some(snapshot.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_images_and_snapshots_tagged_per_region() {
        let cloud = FakeCloud::new("us-east-1");
        let east = image_with_snapshot(&cloud, "snap-east");
        let west = image_with_snapshot(&cloud.in_region("us-west-2"), "snap-west");
        let mut state = test_state(&cloud);
        state.amis.insert("us-east-1".into(), east.clone());
        state.amis.insert("us-west-2".into(), west.clone());
        state.snapshots.insert("us-east-1".into(), vec!["snap-east".into()]);
        state.snapshots.insert("us-west-2".into(), vec!["snap-west".into()]);

        let mut step = StepCreateTags::new(
            BTreeMap::from([("Built".to_string(), "{{ build_region }}".to_string())]),
            BTreeMap::from([("Kind".to_string(), "root".to_string())]),
        );
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);

        assert_eq!(cloud.tags_of(&west), vec![Tag::new("Built", "us-east-1")]);
        assert_eq!(cloud.tags_of("snap-east"), vec![Tag::new("Kind", "root")]);
        assert_eq!(cloud.tags_of("snap-west"), vec![Tag::new("Kind", "root")]);
        assert!(!cloud.tags_of(&east).contains(&Tag::new("Kind", "root")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_retried() {
        let cloud = FakeCloud::new("us-east-1");
        let image = image_with_snapshot(&cloud, "snap-1");
        cloud.fail_next("CreateTags", "InvalidAMIID.NotFound", "not yet", 2);
        let mut state = test_state(&cloud);
        state.amis.insert("us-east-1".into(), image.clone());

        let mut step = StepCreateTags::new(
            BTreeMap::from([("Name".to_string(), "golden".to_string())]),
            BTreeMap::new(),
        );
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert_eq!(cloud.count("CreateTags"), 3);
        assert_eq!(cloud.tags_of(&image), vec![Tag::new("Name", "golden")]);
    }
}
