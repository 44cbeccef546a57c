//! Builders assemble steps into a pipeline and turn its outcome into an artifact

mod chroot;
mod ebs;
mod surrogate;

pub use chroot::{ChrootBuilder, LOCK_PATH_ENV};
pub use ebs::EbsBuilder;
pub use surrogate::SurrogateBuilder;

use crate::artifact::Artifact;
use crate::communicator::Communicator;
use crate::error::{BuildError, Result};
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, CloudClients, CloudError, RunReport, Runner, Step, Ui};
use amiflow_config::{BuilderConfig, Polling};
use std::sync::Arc;
use tracing::{info, warn};

pub const EBS_BUILDER_ID: &str = "amiflow.amazon-ebs";
pub const CHROOT_BUILDER_ID: &str = "amiflow.amazon-chroot";
pub const SURROGATE_BUILDER_ID: &str = "amiflow.amazon-ebssurrogate";

/// Everything a build needs besides its own configuration
#[derive(Clone)]
pub struct BuildContext {
    pub clients: CloudClients,
    pub ui: Arc<dyn Ui>,
    /// Runs commands on the machine driving the build
    pub host_shell: Arc<dyn Communicator>,
    /// Provisioning commands, run on the machine being imaged
    pub commands: Vec<String>,
    /// Used instead of connecting to the source instance over SSH
    pub communicator: Option<Arc<dyn Communicator>>,
}

pub trait Builder: Send + Sync {
    fn id(&self) -> &'static str;

    fn polling(&self) -> Polling;

    /// Seed the state before the first step runs
    fn prepare_state(&self, _state: &mut BuildState) {}

    fn steps(&self, commands: Vec<String>) -> Vec<Box<dyn Step<BuildState>>>;
}

/// Pick the builder for a validated template entry
pub fn from_config(config: &BuilderConfig) -> Box<dyn Builder> {
    match config {
        BuilderConfig::Ebs(c) => Box::new(EbsBuilder::new((**c).clone())),
        BuilderConfig::Chroot(c) => Box::new(ChrootBuilder::new((**c).clone())),
        BuilderConfig::Surrogate(c) => Box::new(SurrogateBuilder::new((**c).clone())),
    }
}

/// Run every step of `builder`, then clean up in reverse order
///
/// Returns `None` when the build finished without registering an image.
pub async fn run(
    builder: &dyn Builder,
    context: BuildContext,
    cancel: &CancellationToken,
) -> Result<Option<Artifact>> {
    let ui = context.ui.clone();
    let mut state = BuildState::new(
        context.clients,
        context.ui,
        builder.polling(),
        context.host_shell,
    );
    state.communicator = context.communicator;
    builder.prepare_state(&mut state);

    let mut runner = Runner::new(builder.steps(context.commands));
    info!(builder = builder.id(), steps = ?runner.step_names(), "Starting build");
    let report = runner.run(cancel, &mut state).await;

    for failure in &report.cleanup_errors {
        ui.error(&format!(
            "Cleanup of {} failed, resources may be left behind: {}",
            failure.step, failure.error
        ));
    }
    outcome(builder.id(), &report, &mut state)
}

fn outcome(
    builder_id: &str,
    report: &RunReport,
    state: &mut BuildState,
) -> Result<Option<Artifact>> {
    if report.cancelled {
        warn!(builder = builder_id, "Build cancelled");
        return Err(BuildError::Cancelled);
    }
    if let Some(step) = report.halted_step {
        let source = state
            .take_error()
            .unwrap_or(CloudError::MissingState("error"));
        return Err(BuildError::Halted { step, source });
    }
    if state.amis.is_empty() {
        info!(builder = builder_id, "Build finished without an image");
        return Ok(None);
    }

    let artifact = Artifact {
        builder_id: builder_id.to_string(),
        amis: std::mem::take(&mut state.amis),
        snapshots: std::mem::take(&mut state.snapshots),
    };
    info!(builder = builder_id, artifact = %artifact.id(), "Build finished");
    Ok(Some(artifact))
}
