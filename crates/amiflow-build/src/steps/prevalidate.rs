use super::finish;
use crate::state::BuildState;
use crate::template::clean_resource_name;
use amiflow_cloud::{CancellationToken, CloudError, ImageQuery, Result, Step, StepAction};
use async_trait::async_trait;

/// Render the image name and refuse to clobber an existing image
pub struct StepPreValidate {
    name_template: String,
    force_deregister: bool,
    skip_create_ami: bool,
}

impl StepPreValidate {
    pub fn new(
        name_template: impl Into<String>,
        force_deregister: bool,
        skip_create_ami: bool,
    ) -> Self {
        Self {
            name_template: name_template.into(),
            force_deregister,
            skip_create_ami,
        }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<()> {
        let name = clean_resource_name(&state.names.render(&self.name_template)?);
        state.ami_name = Some(name.clone());

        if self.skip_create_ami {
            state.ui.say("Skipping AMI name check: no AMI will be created");
            return Ok(());
        }
        if self.force_deregister {
            state
                .ui
                .say("Force deregister is set, skipping the AMI name check");
            return Ok(());
        }

        state.ui.say(&format!("Prevalidating AMI name: {}", name));
        let query = ImageQuery {
            owners: vec!["self".to_string()],
            ..ImageQuery::by_name(name.clone())
        };
        let existing = state.clients.compute.describe_images(&query).await?;
        if let Some(image) = existing.first() {
            return Err(CloudError::ResourceAlreadyExists(format!(
                "an AMI named '{}' ({}) already exists; set force_deregister to replace it",
                name, image.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepPreValidate {
    fn name(&self) -> &'static str {
        "pre_validate"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}
