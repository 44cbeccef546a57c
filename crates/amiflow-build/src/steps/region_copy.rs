use super::{delete_image, finish};
use crate::state::BuildState;
use amiflow_cloud::{
    CancellationToken, CloudError, CopyImageRequest, RegionalClients, Result, Retry, Step,
    StepAction, Waiter, fan_out,
};
use amiflow_config::AmiConfig;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Regions that should end up holding the image
///
/// The build region is always present unless an intermediary image is
/// discarded and the build region is explicitly skipped.
pub fn dedup_regions(
    build_region: &str,
    requested: &[String],
    intermediary: bool,
    skip_build_region: bool,
) -> BTreeSet<String> {
    let mut regions: BTreeSet<String> = requested.iter().cloned().collect();
    regions.insert(build_region.to_string());
    if intermediary && skip_build_region {
        regions.remove(build_region);
    }
    regions
}

/// Copy the build image to every target region concurrently
pub struct StepAmiRegionCopy {
    ami: AmiConfig,
    /// Image the copies were made from
    source_image: Option<String>,
}

struct CopyJob<'a> {
    regions: &'a dyn RegionalClients,
    waiter: Waiter,
    source_region: &'a str,
    source_image_id: &'a str,
    name: &'a str,
    description: Option<&'a str>,
    encrypted: bool,
    completion_minutes: Option<i64>,
}

impl CopyJob<'_> {
    async fn copy(
        &self,
        cancel: &CancellationToken,
        region: &str,
        kms_key_id: Option<String>,
    ) -> Result<(String, Vec<String>)> {
        let compute = self.regions.compute(region).await?;
        let request = CopyImageRequest {
            source_region: self.source_region.to_string(),
            source_image_id: self.source_image_id.to_string(),
            name: self.name.to_string(),
            description: self.description.map(str::to_string),
            encrypted: self.encrypted,
            kms_key_id,
            completion_duration_minutes: self.completion_minutes,
        };
        let image_id = Retry::new(5)
            .run(cancel, || compute.copy_image(&request))
            .await?;
        info!(region, image = %image_id, "Started image copy");

        self.waiter
            .until_state(
                cancel,
                &format!("AMI copy in {}", region),
                "available",
                &["failed", "error", "invalid"],
                || async {
                    let image = compute.describe_image(&image_id).await?;
                    Ok(image.state.as_str().to_string())
                },
            )
            .await?;

        let image = compute.describe_image(&image_id).await?;
        Ok((image_id, image.snapshot_ids()))
    }
}

impl StepAmiRegionCopy {
    pub fn new(ami: AmiConfig) -> Self {
        Self {
            ami,
            source_image: None,
        }
    }

    fn intermediary(&self) -> bool {
        self.ami.is_encrypted()
    }

    fn kms_key_for(&self, region: &str) -> Option<String> {
        self.ami
            .region_kms_key_ids
            .get(region)
            .cloned()
            .or_else(|| self.ami.kms_key_id.clone().filter(|_| self.ami.is_encrypted()))
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let build_region = state.region().to_string();
        let intermediary = self.intermediary();
        let skip = self.ami.skip_save_build_region;
        let regions = dedup_regions(&build_region, &self.ami.ami_regions, intermediary, skip);
        let targets: Vec<String> = regions
            .into_iter()
            .filter(|region| intermediary || *region != build_region)
            .collect();

        if targets.is_empty() && !skip {
            return Ok(());
        }

        let source_image_id = state.build_image()?.to_string();
        self.source_image = Some(source_image_id.clone());
        let source_snapshots = state.snapshots.get(&build_region).cloned().unwrap_or_default();

        if !targets.is_empty() {
            let name = state.ami_name()?.to_string();
            let description = match &self.ami.ami_description {
                Some(template) => Some(state.names.render(template)?),
                None => None,
            };
            state
                .ui
                .say(&format!("Copying/Encrypting AMI ({}) to other regions...", source_image_id));

            let job = CopyJob {
                regions: state.clients.regions.as_ref(),
                waiter: state.waiter().tolerate_not_found(),
                source_region: &build_region,
                source_image_id: &source_image_id,
                name: &name,
                description: description.as_deref(),
                encrypted: self.ami.is_encrypted(),
                completion_minutes: self.ami.snapshot_copy_completion_minutes(),
            };
            for region in &targets {
                state.ui.message(&format!("Copying to: {}", region));
            }
            let outcome = fan_out(&targets, |region| {
                let job = &job;
                let kms_key_id = self.kms_key_for(&region);
                async move { job.copy(cancel, &region, kms_key_id).await }
            })
            .await;

            let mut copied: BTreeMap<String, (String, Vec<String>)> = outcome.succeeded;
            if !outcome.errors.is_empty() {
                let done: Vec<String> = copied
                    .iter()
                    .map(|(region, (image, _))| format!("{}: {}", region, image))
                    .collect();
                for (region, (image, snapshots)) in std::mem::take(&mut copied) {
                    state.amis.insert(region.clone(), image);
                    state.snapshots.insert(region, snapshots);
                }
                if !done.is_empty() {
                    state.ui.error(&format!(
                        "Some region copies succeeded and are left in place: {}",
                        done.join(", ")
                    ));
                }
                return Err(CloudError::Multi(outcome.errors));
            }

            for (region, (image, snapshots)) in copied {
                state.ui.message(&format!("AMI {} available in {}", image, region));
                state.amis.insert(region.clone(), image);
                state.snapshots.insert(region, snapshots);
            }
        }

        let replaced = intermediary && targets.contains(&build_region);
        if intermediary || skip {
            state.ui.say(&format!(
                "Deregistering the intermediary AMI {} and deleting its snapshots",
                source_image_id
            ));
            let compute = state.clients.compute.clone();
            delete_image(cancel, compute.as_ref(), &source_image_id, &source_snapshots).await?;
            if !replaced {
                state.amis.remove(&build_region);
                state.snapshots.remove(&build_region);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepAmiRegionCopy {
    fn name(&self) -> &'static str {
        "ami_region_copy"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        if !state.is_aborted() {
            return Ok(());
        }
        let Some(source_image) = self.source_image.take() else {
            return Ok(());
        };
        let build_region = state.region().to_string();
        // An encrypted copy in the build region counts as a copy too
        let copies: Vec<String> = state
            .amis
            .iter()
            .filter(|(region, image)| **region != build_region || **image != source_image)
            .map(|(region, image)| format!("{}: {}", region, image))
            .collect();
        if !copies.is_empty() {
            warn!(copies = ?copies, "Region copies left after an aborted build");
            state.ui.error(&format!(
                "The build did not finish; these region copies were kept and may need manual removal: {}",
                copies.join(", ")
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_state;
    use amiflow_cloud::fake::FakeCloud;
    use amiflow_cloud::{BlockDeviceMapping, BufferUi, EbsBlockDevice, Image, PipelineState};
    use std::sync::Arc;

    fn regions(list: &[&str]) -> Vec<String> {
        list.iter().map(|r| r.to_string()).collect()
    }

    fn set(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_dedup_keeps_build_region_once() {
        let requested = regions(&["us-east-1", "us-west-2", "us-west-2"]);
        let first = dedup_regions("us-east-1", &requested, false, false);
        assert_eq!(first, set(&["us-east-1", "us-west-2"]));
        assert_eq!(dedup_regions("us-east-1", &requested, false, false), first);
    }

    #[test]
    fn test_dedup_excludes_build_region_only_for_skipped_intermediary() {
        let requested = regions(&["us-west-2"]);
        assert_eq!(dedup_regions("us-east-1", &requested, true, true), set(&["us-west-2"]));
        assert_eq!(
            dedup_regions("us-east-1", &requested, false, true),
            set(&["us-east-1", "us-west-2"])
        );
        assert_eq!(
            dedup_regions("us-east-1", &requested, true, false),
            set(&["us-east-1", "us-west-2"])
        );
    }

    fn built(cloud: &FakeCloud, state: &mut BuildState) -> String {
        let id = cloud.seed_image(Image {
            name: "golden".into(),
            root_device_name: Some("/dev/xvda".into()),
            block_device_mappings: vec![BlockDeviceMapping {
                device_name: "/dev/xvda".into(),
                ebs: Some(EbsBlockDevice {
                    snapshot_id: Some("snap-build".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        state.ami_name = Some("golden".into());
        state.amis.insert("us-east-1".into(), id.clone());
        state.snapshots.insert("us-east-1".into(), vec!["snap-build".into()]);
        id
    }

    #[tokio::test]
    async fn test_copies_to_every_other_region() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let original = built(&cloud, &mut state);
        let mut step = StepAmiRegionCopy::new(AmiConfig {
            ami_regions: regions(&["us-east-1", "us-west-2", "eu-west-1"]),
            ..Default::default()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert_eq!(state.amis.len(), 3);
        assert_eq!(state.amis["us-east-1"], original);
        assert_eq!(cloud.count("CopyImage"), 2);
        assert_eq!(cloud.images_in("eu-west-1").len(), 1);
        assert_eq!(state.snapshots["us-west-2"].len(), 1);
    }

    #[tokio::test]
    async fn test_two_of_three_failures_are_all_reported() {
        let cloud = FakeCloud::new("us-east-1");
        cloud.fail_always_in("us-west-2", "CopyImage", "InvalidParameter");
        cloud.fail_always_in("eu-west-1", "CopyImage", "UnauthorizedOperation");
        let mut state = test_state(&cloud);
        built(&cloud, &mut state);
        let mut step = StepAmiRegionCopy::new(AmiConfig {
            ami_regions: regions(&["us-west-2", "eu-west-1", "ap-south-1"]),
            ..Default::default()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Halt);
        let Some(CloudError::Multi(errors)) = state.error() else {
            panic!("expected a multi-error, got {:?}", state.error());
        };
        assert_eq!(errors.len(), 2);
        let message = errors.to_string();
        assert!(message.contains("us-west-2"));
        assert!(message.contains("eu-west-1"));
        assert!(state.amis.contains_key("ap-south-1"));
        assert!(state.amis.contains_key("us-east-1"));
    }

    #[tokio::test]
    async fn test_encrypted_intermediary_replaces_original() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let original = built(&cloud, &mut state);
        let mut step = StepAmiRegionCopy::new(AmiConfig {
            encrypt_boot: Some(true),
            kms_key_id: Some("alias/build".into()),
            ami_regions: regions(&["us-west-2"]),
            region_kms_key_ids: BTreeMap::from([("us-west-2".to_string(), "alias/west".to_string())]),
            ..Default::default()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert_ne!(state.amis["us-east-1"], original);
        assert!(cloud.image(&original).is_none());
        assert!(!cloud.snapshot_exists("snap-build"));

        let west = cloud.image(&state.amis["us-west-2"]).unwrap();
        let ebs = west.block_device_mappings[0].ebs.clone().unwrap();
        assert_eq!(ebs.kms_key_id.as_deref(), Some("alias/west"));
        let east = cloud.image(&state.amis["us-east-1"]).unwrap();
        let ebs = east.block_device_mappings[0].ebs.clone().unwrap();
        assert_eq!(ebs.kms_key_id.as_deref(), Some("alias/build"));
    }

    #[tokio::test]
    async fn test_aborted_build_reports_encrypted_build_region_copy() {
        let cloud = FakeCloud::new("us-east-1");
        let ui = Arc::new(BufferUi::new());
        let mut state = test_state(&cloud);
        state.ui = ui.clone();
        built(&cloud, &mut state);
        let mut step = StepAmiRegionCopy::new(AmiConfig {
            encrypt_boot: Some(true),
            ami_regions: regions(&["us-west-2"]),
            ..Default::default()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let encrypted = state.amis["us-east-1"].clone();
        let west = state.amis["us-west-2"].clone();

        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        let errors = ui.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains(&format!("us-east-1: {}", encrypted)));
        assert!(errors[0].contains(&format!("us-west-2: {}", west)));
    }

    #[tokio::test]
    async fn test_aborted_build_keeps_original_out_of_report() {
        let cloud = FakeCloud::new("us-east-1");
        let ui = Arc::new(BufferUi::new());
        let mut state = test_state(&cloud);
        state.ui = ui.clone();
        let original = built(&cloud, &mut state);
        let mut step = StepAmiRegionCopy::new(AmiConfig {
            ami_regions: regions(&["us-west-2"]),
            ..Default::default()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        state.mark_halted();
        step.cleanup(&mut state).await.unwrap();
        let errors = ui.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("us-west-2: "));
        assert!(!errors[0].contains(&original));
    }

    #[tokio::test]
    async fn test_skip_build_region_drops_original() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let original = built(&cloud, &mut state);
        let mut step = StepAmiRegionCopy::new(AmiConfig {
            skip_save_build_region: true,
            ami_regions: regions(&["us-west-2"]),
            ..Default::default()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert!(cloud.image(&original).is_none());
        assert_eq!(state.amis.keys().collect::<Vec<_>>(), vec!["us-west-2"]);
    }

    #[test]
    fn test_kms_key_selection() {
        let step = StepAmiRegionCopy::new(AmiConfig {
            encrypt_boot: Some(true),
            kms_key_id: Some("alias/global".into()),
            region_kms_key_ids: BTreeMap::from([("us-west-2".to_string(), "alias/west".to_string())]),
            ..Default::default()
        });
        assert_eq!(step.kms_key_for("us-west-2").as_deref(), Some("alias/west"));
        assert_eq!(step.kms_key_for("eu-west-1").as_deref(), Some("alias/global"));

        let plain = StepAmiRegionCopy::new(AmiConfig {
            kms_key_id: Some("alias/global".into()),
            ..Default::default()
        });
        assert_eq!(plain.kms_key_for("eu-west-1"), None);
    }
}
