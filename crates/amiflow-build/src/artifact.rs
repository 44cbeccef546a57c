//! The images a successful build leaves behind

use amiflow_cloud::{CancellationToken, MultiError, RegionalClients, Retry, fan_out};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub builder_id: String,
    /// Region to image ID
    pub amis: BTreeMap<String, String>,
    /// Region to the snapshots backing that region's image
    pub snapshots: BTreeMap<String, Vec<String>>,
}

impl Artifact {
    /// `region:ami` pairs sorted by region, comma separated
    pub fn id(&self) -> String {
        self.amis
            .iter()
            .map(|(region, ami)| format!("{}:{}", region, ami))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Deregister every image and delete its snapshots
    pub async fn destroy(
        &self,
        cancel: &CancellationToken,
        regions: &dyn RegionalClients,
    ) -> std::result::Result<(), MultiError> {
        let keys: Vec<String> = self.amis.keys().cloned().collect();
        let outcome = fan_out(&keys, |region| async move {
            let compute = regions.compute(&region).await?;
            let Some(image_id) = self.amis.get(&region) else {
                return Ok(());
            };
            info!(region = %region, image = %image_id, "Deregistering image");
            compute.deregister_image(image_id).await?;

            let retry = Retry::new(5)
                .retry_if(|e| e.is_code(&["InvalidSnapshot.InUse"]) || e.is_throttled());
            for snapshot in self.snapshots.get(&region).into_iter().flatten() {
                retry.run(cancel, || compute.delete_snapshot(snapshot)).await?;
            }
            Ok(())
        })
        .await;

        if outcome.is_success() {
            Ok(())
        } else {
            Err(outcome.errors)
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AMIs were created:")?;
        for (region, ami) in &self.amis {
            writeln!(f, "{}: {}", region, ami)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amiflow_cloud::fake::FakeCloud;
    use amiflow_cloud::{BlockDeviceMapping, EbsBlockDevice, Image};

    fn artifact() -> Artifact {
        Artifact {
            builder_id: "amiflow.amazon-ebs".into(),
            amis: BTreeMap::from([
                ("west".to_string(), "bar".to_string()),
                ("east".to_string(), "foo".to_string()),
            ]),
            snapshots: BTreeMap::new(),
        }
    }

    #[test]
    fn test_id_sorted_by_region() {
        assert_eq!(artifact().id(), "east:foo,west:bar");
    }

    #[test]
    fn test_display_one_region_per_line() {
        let text = artifact().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["AMIs were created:", "east: foo", "west: bar"]);
    }

    #[tokio::test]
    async fn test_destroy_removes_images_and_snapshots() {
        let cloud = FakeCloud::new("us-east-1");
        let image_id = cloud.seed_image(Image {
            name: "golden".into(),
            block_device_mappings: vec![BlockDeviceMapping {
                device_name: "/dev/xvda".into(),
                ebs: Some(EbsBlockDevice {
                    snapshot_id: Some("snap-1".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        let artifact = Artifact {
            builder_id: "amiflow.amazon-ebs".into(),
            amis: BTreeMap::from([("us-east-1".to_string(), image_id.clone())]),
            snapshots: BTreeMap::from([("us-east-1".to_string(), vec!["snap-1".to_string()])]),
        };

        artifact.destroy(&CancellationToken::new(), &cloud).await.unwrap();
        assert!(cloud.image(&image_id).is_none());
        assert!(!cloud.snapshot_exists("snap-1"));
    }
}
