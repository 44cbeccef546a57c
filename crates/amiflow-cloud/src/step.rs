//! Step contract for build pipelines

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Outcome of a step's forward run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Proceed to the next step
    Continue,
    /// Stop forward progress and unwind
    Halt,
}

/// State shared by the steps of one pipeline
///
/// The runner flags the state before unwinding so cleanups can tell a
/// successful build from an aborted one.
pub trait PipelineState: Send {
    fn mark_cancelled(&mut self);
    fn mark_halted(&mut self);
}

/// A unit of work with a forward `run` and a reverse `cleanup`
///
/// A step keeps the identifiers of whatever it created in its own fields and
/// clears them in `cleanup`, so cleaning up twice never touches the cloud
/// twice.
#[async_trait]
pub trait Step<S: PipelineState>: Send {
    fn name(&self) -> &'static str;

    async fn run(&mut self, cancel: &CancellationToken, state: &mut S) -> StepAction;

    async fn cleanup(&mut self, state: &mut S) -> Result<()>;
}

/// A step that can also be cleaned up ahead of the runner's unwind
///
/// The chroot builder detaches and unmounts its volume before snapshotting;
/// the runner's later cleanup of the same step is then a no-op.
pub struct SharedStep<S> {
    name: &'static str,
    inner: Arc<Mutex<Box<dyn Step<S>>>>,
}

impl<S: PipelineState + 'static> SharedStep<S> {
    pub fn new(step: impl Step<S> + 'static) -> Self {
        Self {
            name: step.name(),
            inner: Arc::new(Mutex::new(Box::new(step))),
        }
    }

    pub async fn cleanup_now(&self, state: &mut S) -> Result<()> {
        self.inner.lock().await.cleanup(state).await
    }
}

impl<S> Clone for SharedStep<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl<S: PipelineState + 'static> Step<S> for SharedStep<S> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut S) -> StepAction {
        self.inner.lock().await.run(cancel, state).await
    }

    async fn cleanup(&mut self, state: &mut S) -> Result<()> {
        self.inner.lock().await.cleanup(state).await
    }
}
