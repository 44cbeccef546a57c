use super::finish;
use crate::state::BuildState;
use amiflow_cloud::{
    CancellationToken, CloudError, Filter, Image, ImageQuery, Result, Step, StepAction,
};
use amiflow_config::SourceConfig;
use async_trait::async_trait;
use tracing::info;

/// Resolve the source image by ID or filter
pub struct StepSourceAmiInfo {
    source: SourceConfig,
}

impl StepSourceAmiInfo {
    pub fn new(source: SourceConfig) -> Self {
        Self { source }
    }

    fn query(&self) -> (ImageQuery, bool) {
        if let Some(id) = &self.source.source_ami {
            return (ImageQuery::by_id(id.clone()), false);
        }
        let filter = self.source.source_ami_filter.clone().unwrap_or_default();
        let query = ImageQuery {
            image_ids: Vec::new(),
            owners: filter.owners,
            filters: filter
                .filters
                .into_iter()
                .map(|(name, value)| Filter::new(name, vec![value]))
                .collect(),
        };
        (query, filter.most_recent)
    }

    async fn execute(&self, state: &mut BuildState) -> Result<()> {
        state.ui.say("Inspecting the source AMI...");
        let (query, most_recent) = self.query();
        let images = state.clients.compute.describe_images(&query).await?;

        let image = pick_image(images, most_recent)?;
        if !image.is_ebs_backed() && image.root_device_type.is_some() {
            state
                .ui
                .message(&format!("Source AMI {} is not EBS-backed", image.id));
        }
        info!(image = %image.id, name = %image.name, "Found source image");
        state.ui.message(&format!("Found Image ID: {}", image.id));
        state.names.set_source(&image);
        state.source_image = Some(image);
        Ok(())
    }
}

/// Zero matches fail; several fail unless the newest may be taken
pub(crate) fn pick_image(mut images: Vec<Image>, most_recent: bool) -> Result<Image> {
    match images.len() {
        0 => Err(CloudError::ResourceNotFound(
            "no AMI was found matching the source AMI settings".to_string(),
        )),
        1 => Ok(images.remove(0)),
        n if !most_recent => Err(CloudError::InvalidConfig(format!(
            "the source AMI filter matched {} images; narrow it or set most_recent",
            n
        ))),
        _ => {
            images.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
            images
                .pop()
                .ok_or_else(|| CloudError::ResourceNotFound("source AMI".to_string()))
        }
    }
}

#[async_trait]
impl Step<BuildState> for StepSourceAmiInfo {
    fn name(&self) -> &'static str {
        "source_ami_info"
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

    fn image(id: &str, created: &str) -> Image {
        Image {
            id: id.into(),
            creation_date: Some(created.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_pick_newest() {
        let images = vec![
            image("ami-old", "2024-01-01T00:00:00.000Z"),
            image("ami-new", "2025-06-01T00:00:00.000Z"),
            image("ami-mid", "2024-09-01T00:00:00.000Z"),
        ];
        assert_eq!(pick_image(images, true).unwrap().id, "ami-new");
    }

    #[test]
    fn test_ambiguous_without_most_recent() {
        let images = vec![image("a", "1"), image("b", "2")];
        assert!(matches!(pick_image(images, false), Err(CloudError::InvalidConfig(_))));
        assert!(pick_image(Vec::new(), true).unwrap_err().is_not_found());
    }
}
