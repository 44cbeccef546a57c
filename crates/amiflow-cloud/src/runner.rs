//! Sequential step runner with reverse-order unwind

use crate::error::CloudError;
use crate::step::{PipelineState, Step, StepAction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A cleanup that failed during unwind
#[derive(Debug)]
pub struct CleanupFailure {
    pub step: &'static str,
    pub error: CloudError,
}

/// What happened during one `Runner::run`
#[derive(Debug, Default)]
pub struct RunReport {
    /// Every step ran and continued
    pub completed: bool,
    pub cancelled: bool,
    /// Name of the step that returned `Halt`
    pub halted_step: Option<&'static str>,
    pub cleanup_errors: Vec<CleanupFailure>,
}

/// Runs an ordered list of steps
pub struct Runner<S> {
    steps: Vec<Box<dyn Step<S>>>,
}

impl<S: PipelineState + 'static> Runner<S> {
    pub fn new(steps: Vec<Box<dyn Step<S>>>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, then clean up the started ones in reverse
    ///
    /// Cleanup runs on halt, on cancellation, and on normal completion. A
    /// failing cleanup never stops the remaining ones.
    pub async fn run(&mut self, cancel: &CancellationToken, state: &mut S) -> RunReport {
        let mut report = RunReport::default();
        let mut started = 0;

        for step in self.steps.iter_mut() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            debug!(step = step.name(), "Running step");
            started += 1;

            if step.run(cancel, state).await == StepAction::Halt {
                info!(step = step.name(), "Step halted the build");
                report.halted_step = Some(step.name());
                if cancel.is_cancelled() {
                    report.cancelled = true;
                }
                break;
            }
        }

        if !report.cancelled && report.halted_step.is_none() && cancel.is_cancelled() {
            report.cancelled = true;
        }
        if report.cancelled {
            state.mark_cancelled();
        }
        if report.halted_step.is_some() {
            state.mark_halted();
        }
        report.completed =
            !report.cancelled && report.halted_step.is_none() && started == self.steps.len();

        for step in self.steps[..started].iter_mut().rev() {
            debug!(step = step.name(), "Cleaning up step");
            if let Err(error) = step.cleanup(state).await {
                warn!(step = step.name(), error = %error, "Cleanup failed");
                report.cleanup_errors.push(CleanupFailure {
                    step: step.name(),
                    error,
                });
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Journal {
        cancelled: bool,
        halted: bool,
        events: Vec<String>,
    }

    impl PipelineState for Journal {
        fn mark_cancelled(&mut self) {
            self.cancelled = true;
        }

        fn mark_halted(&mut self) {
            self.halted = true;
        }
    }

    struct Recorder {
        name: &'static str,
        action: StepAction,
        fail_cleanup: bool,
        cancel_during_run: Option<CancellationToken>,
    }

    impl Recorder {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                action: StepAction::Continue,
                fail_cleanup: false,
                cancel_during_run: None,
            }
        }

        fn halting(name: &'static str) -> Self {
            Self {
                action: StepAction::Halt,
                ..Self::ok(name)
            }
        }
    }

    #[async_trait]
    impl Step<Journal> for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&mut self, _cancel: &CancellationToken, state: &mut Journal) -> StepAction {
            state.events.push(format!("run:{}", self.name));
            if let Some(token) = &self.cancel_during_run {
                token.cancel();
            }
            self.action
        }

        async fn cleanup(&mut self, state: &mut Journal) -> Result<()> {
            state.events.push(format!("cleanup:{}", self.name));
            if self.fail_cleanup {
                return Err(CloudError::CommandFailed(format!("{} cleanup", self.name)));
            }
            Ok(())
        }
    }

    fn boxed(steps: Vec<Recorder>) -> Vec<Box<dyn Step<Journal>>> {
        steps
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn Step<Journal>>)
            .collect()
    }

    #[tokio::test]
    async fn test_completed_run_cleans_up_in_reverse() {
        let mut runner = Runner::new(boxed(vec![
            Recorder::ok("a"),
            Recorder::ok("b"),
            Recorder::ok("c"),
        ]));
        let mut state = Journal::default();

        let report = runner.run(&CancellationToken::new(), &mut state).await;

        assert!(report.completed);
        assert!(!state.halted && !state.cancelled);
        assert_eq!(
            state.events,
            vec!["run:a", "run:b", "run:c", "cleanup:c", "cleanup:b", "cleanup:a"]
        );
    }

    #[tokio::test]
    async fn test_halt_cleans_up_halting_step_and_predecessors_only() {
        let mut runner = Runner::new(boxed(vec![
            Recorder::ok("a"),
            Recorder::ok("b"),
            Recorder::halting("c"),
            Recorder::ok("d"),
        ]));
        let mut state = Journal::default();

        let report = runner.run(&CancellationToken::new(), &mut state).await;

        assert!(!report.completed);
        assert_eq!(report.halted_step, Some("c"));
        assert!(state.halted);
        assert_eq!(
            state.events,
            vec![
                "run:a",
                "run:b",
                "run:c",
                "cleanup:c",
                "cleanup:b",
                "cleanup:a"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_cleanup_does_not_stop_unwind() {
        let mut failing = Recorder::ok("b");
        failing.fail_cleanup = true;
        let mut runner = Runner::new(boxed(vec![
            Recorder::ok("a"),
            failing,
            Recorder::halting("c"),
        ]));
        let mut state = Journal::default();

        let report = runner.run(&CancellationToken::new(), &mut state).await;

        assert_eq!(report.cleanup_errors.len(), 1);
        assert_eq!(report.cleanup_errors[0].step, "b");
        assert_eq!(state.events.last().map(String::as_str), Some("cleanup:a"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_forward_progress() {
        let token = CancellationToken::new();
        let mut cancelling = Recorder::ok("b");
        cancelling.cancel_during_run = Some(token.clone());
        let mut runner = Runner::new(boxed(vec![
            Recorder::ok("a"),
            cancelling,
            Recorder::ok("c"),
        ]));
        let mut state = Journal::default();

        let report = runner.run(&token, &mut state).await;

        assert!(report.cancelled);
        assert!(state.cancelled);
        assert!(!report.completed);
        assert_eq!(
            state.events,
            vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_runs_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let mut runner = Runner::new(boxed(vec![Recorder::ok("a")]));
        let mut state = Journal::default();

        let report = runner.run(&token, &mut state).await;

        assert!(report.cancelled);
        assert!(state.events.is_empty());
    }

    struct CountingCleanup {
        cleanups: Arc<Mutex<u32>>,
        created: Option<String>,
    }

    #[async_trait]
    impl Step<Journal> for CountingCleanup {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&mut self, _cancel: &CancellationToken, _state: &mut Journal) -> StepAction {
            self.created = Some("vol-1".to_string());
            StepAction::Continue
        }

        async fn cleanup(&mut self, _state: &mut Journal) -> Result<()> {
            if self.created.take().is_some() {
                *self.cleanups.lock().unwrap() += 1;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shared_step_early_cleanup_is_not_repeated() {
        let cleanups = Arc::new(Mutex::new(0));
        let shared = crate::SharedStep::new(CountingCleanup {
            cleanups: Arc::clone(&cleanups),
            created: None,
        });
        let early = shared.clone();
        let mut step: Box<dyn Step<Journal>> = Box::new(shared);
        let mut state = Journal::default();
        let token = CancellationToken::new();

        step.run(&token, &mut state).await;
        early.cleanup_now(&mut state).await.unwrap();
        step.cleanup(&mut state).await.unwrap();

        assert_eq!(*cleanups.lock().unwrap(), 1);
    }
}
