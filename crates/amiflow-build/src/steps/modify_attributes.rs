use super::finish;
use crate::state::BuildState;
use amiflow_cloud::{
    CancellationToken, CloudError, ImageAttribute, LaunchPermissions, Result, Step, StepAction,
    fan_out,
};
use amiflow_config::AmiConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Apply sharing and metadata attributes to the image in every region
pub struct StepModifyAmiAttributes {
    ami: AmiConfig,
}

impl StepModifyAmiAttributes {
    pub fn new(ami: AmiConfig) -> Self {
        Self { ami }
    }

    fn attributes(&self, description: Option<String>) -> Vec<ImageAttribute> {
        let mut attributes = Vec::new();
        if let Some(description) = description {
            attributes.push(ImageAttribute::Description(description));
        }
        let permissions = LaunchPermissions {
            users: self.ami.ami_users.clone(),
            groups: self.ami.ami_groups.clone(),
            organization_arns: self.ami.ami_org_arns.clone(),
            organizational_unit_arns: self.ami.ami_ou_arns.clone(),
        };
        if !permissions.is_empty() {
            attributes.push(ImageAttribute::LaunchPermission(permissions));
        }
        if !self.ami.ami_product_codes.is_empty() {
            attributes.push(ImageAttribute::ProductCodes(self.ami.ami_product_codes.clone()));
        }
        if let Some(imds) = &self.ami.imds_support {
            attributes.push(ImageAttribute::ImdsSupport(imds.clone()));
        }
        attributes
    }

    fn shares_snapshots(&self) -> bool {
        !self.ami.snapshot_users.is_empty() || !self.ami.snapshot_groups.is_empty()
    }

    async fn execute(&self, state: &mut BuildState) -> Result<()> {
        let description = match &self.ami.ami_description {
            Some(template) => Some(state.names.render(template)?),
            None => None,
        };
        let attributes = self.attributes(description);
        if attributes.is_empty() && !self.shares_snapshots() {
            return Ok(());
        }

        state.ui.say("Modifying attributes on AMI and snapshots...");
        let amis: BTreeMap<String, String> = state.amis.clone();
        let snapshots = state.snapshots.clone();
        let regions: Vec<String> = amis.keys().cloned().collect();
        let clients = state.clients.regions.clone();

        let outcome = fan_out(&regions, |region| {
            let clients = clients.clone();
            let attributes = &attributes;
            let image_id = amis.get(&region).cloned().unwrap_or_default();
            let snapshot_ids = snapshots.get(&region).cloned().unwrap_or_default();
            async move {
                let compute = clients.compute(&region).await?;
                for attribute in attributes {
                    compute.modify_image_attribute(&image_id, attribute).await?;
                }
                if self.shares_snapshots() {
                    for snapshot in &snapshot_ids {
                        compute
                            .add_create_volume_permission(
                                snapshot,
                                &self.ami.snapshot_users,
                                &self.ami.snapshot_groups,
                            )
                            .await?;
                    }
                }
                Ok(())
            }
        })
        .await;

        for region in outcome.succeeded.keys() {
            state
                .ui
                .message(&format!("Updated attributes of {} in {}", amis[region], region));
        }
        if outcome.is_success() {
            Ok(())
        } else {
            Err(CloudError::Multi(outcome.errors))
        }
    }
}

#[async_trait]
impl Step<BuildState> for StepModifyAmiAttributes {
    fn name(&self) -> &'static str {
        "modify_ami_attributes"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
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
    use amiflow_cloud::Image;
    use amiflow_cloud::fake::FakeCloud;

    #[tokio::test]
    async fn test_attributes_in_every_region() {
        let cloud = FakeCloud::new("us-east-1");
        let east = cloud.seed_image(Image::default());
        let west = cloud.in_region("us-west-2").seed_image(Image::default());
        let mut state = test_state(&cloud);
        state.amis.insert("us-east-1".into(), east.clone());
        state.amis.insert("us-west-2".into(), west.clone());

        let mut step = StepModifyAmiAttributes::new(AmiConfig {
            ami_description: Some("from {{ build_region }}".into()),
            ami_users: vec!["123456789012".into()],
            imds_support: Some("v2.0".into()),
            ..Default::default()
        });
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);

        assert_eq!(cloud.count("ModifyImageAttribute"), 6);
        assert_eq!(cloud.image(&west).unwrap().description.as_deref(), Some("from us-east-1"));
        let west_calls: Vec<_> = cloud
            .calls_for("ModifyImageAttribute")
            .into_iter()
            .filter(|c| c.region == "us-west-2")
            .collect();
        assert_eq!(west_calls.len(), 3);
    }

    #[tokio::test]
    async fn test_nothing_configured_makes_no_calls() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        state.amis.insert("us-east-1".into(), "ami-1".into());
        let mut step = StepModifyAmiAttributes::new(AmiConfig::default());
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_sharing() {
        let cloud = FakeCloud::new("us-east-1");
        let image = cloud.seed_image(Image {
            block_device_mappings: vec![amiflow_cloud::BlockDeviceMapping {
                device_name: "/dev/xvda".into(),
                ebs: Some(amiflow_cloud::EbsBlockDevice {
                    snapshot_id: Some("snap-1".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        let mut state = test_state(&cloud);
        state.amis.insert("us-east-1".into(), image);
        state.snapshots.insert("us-east-1".into(), vec!["snap-1".into()]);

        let mut step = StepModifyAmiAttributes::new(AmiConfig {
            snapshot_users: vec!["210987654321".into()],
            ..Default::default()
        });
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let calls = cloud.calls_for("ModifySnapshotAttribute");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].detail.contains("users=210987654321"));
    }
}
