//! Ordered step execution with reverse-order cleanup.
//!
//! The engine is the sole owner of the halt/continue decision: steps report
//! a [`StepAction`], the engine stops on the first halt or on cancellation,
//! then unwinds cleanup over every step whose `run` was entered, in strict
//! reverse order. Cleanup failures are logged by the steps themselves and
//! never interrupt the unwind.

use color_eyre::eyre::eyre;
use color_eyre::Report;
use tracing::{debug, info, warn};

use crate::context::BuildContext;

/// What a step tells the engine after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop the pipeline and unwind.
    Halt,
}

/// One phase of the build.
///
/// A step is stateless before `run` and may stash private fields (a
/// listener, an attachment reference) that only its own `cleanup` consumes.
/// `cleanup` must be safe to call even when `run` never executed or failed
/// partway, and must log rather than propagate its own failures.
pub trait Step {
    /// Human-readable phase name for diagnostics.
    fn name(&self) -> &'static str;

    /// Execute the phase against the shared context.
    fn run(&mut self, ctx: &mut BuildContext) -> StepAction;

    /// Undo exactly what this step's `run` created. Default: nothing.
    fn cleanup(&mut self, _ctx: &mut BuildContext) {}
}

/// Terminal state of a pipeline run.
#[derive(Debug)]
pub enum BuildOutcome {
    /// Every step ran to completion.
    Completed,
    /// Cancellation was requested before completion.
    Cancelled,
    /// A step halted the pipeline; the first recorded error is attached.
    Failed(Report),
}

/// Run `steps` in order against `ctx`, unwinding on halt or cancellation.
pub fn run_steps(steps: &mut [Box<dyn Step>], ctx: &mut BuildContext) -> BuildOutcome {
    let mut ran = 0;
    let mut halted = false;
    let mut cancelled = false;

    for step in steps.iter_mut() {
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        debug!(step = step.name(), "running step");
        ran += 1;
        match step.run(ctx) {
            StepAction::Continue => {}
            StepAction::Halt => {
                halted = true;
                break;
            }
        }
        // A cancellation that arrived while the step was blocking is
        // honored before the next step starts.
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            break;
        }
    }

    if halted || cancelled {
        warn!(
            halted,
            cancelled, "pipeline stopped early, unwinding {ran} steps"
        );
    }

    for step in steps[..ran].iter_mut().rev() {
        debug!(step = step.name(), "cleaning up step");
        step.cleanup(ctx);
    }

    if let Some(err) = ctx.error.take() {
        return BuildOutcome::Failed(err);
    }
    if cancelled || ctx.cancel.is_cancelled() {
        return BuildOutcome::Cancelled;
    }
    if halted {
        // A step halted without recording why; still a failure.
        return BuildOutcome::Failed(eyre!("build halted without a recorded error"));
    }
    info!("all steps completed");
    BuildOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::controlplane::tests_support::FakeControlPlane;
    use std::sync::{Arc, Mutex};

    fn test_context() -> BuildContext {
        let config = BuildConfig::from_toml(
            r#"
                vm_name = "engine-test"

                [remote]
                host = "h"
                username = "u"
                password = "p"
            "#,
        )
        .unwrap();
        BuildContext::new(config, Arc::new(FakeControlPlane::default()))
    }

    /// Records run/cleanup invocations into a shared journal.
    struct Scripted {
        label: &'static str,
        action: StepAction,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Step for Scripted {
        fn name(&self) -> &'static str {
            self.label
        }

        fn run(&mut self, _ctx: &mut BuildContext) -> StepAction {
            self.journal
                .lock()
                .unwrap()
                .push(format!("run:{}", self.label));
            self.action
        }

        fn cleanup(&mut self, _ctx: &mut BuildContext) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("cleanup:{}", self.label));
        }
    }

    fn scripted(
        label: &'static str,
        action: StepAction,
        journal: &Arc<Mutex<Vec<String>>>,
    ) -> Box<dyn Step> {
        Box::new(Scripted {
            label,
            action,
            journal: journal.clone(),
        })
    }

    #[test]
    fn all_steps_run_and_unwind_in_reverse() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut steps = vec![
            scripted("a", StepAction::Continue, &journal),
            scripted("b", StepAction::Continue, &journal),
            scripted("c", StepAction::Continue, &journal),
        ];
        let mut ctx = test_context();
        let outcome = run_steps(&mut steps, &mut ctx);
        assert!(matches!(outcome, BuildOutcome::Completed));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["run:a", "run:b", "run:c", "cleanup:c", "cleanup:b", "cleanup:a"]
        );
    }

    #[test]
    fn halt_unwinds_only_steps_that_ran() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut steps = vec![
            scripted("a", StepAction::Continue, &journal),
            scripted("b", StepAction::Halt, &journal),
            scripted("c", StepAction::Continue, &journal),
        ];
        let mut ctx = test_context();
        let outcome = run_steps(&mut steps, &mut ctx);
        assert!(matches!(outcome, BuildOutcome::Failed(_)));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]
        );
    }

    #[test]
    fn halting_step_itself_gets_cleanup() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut steps = vec![scripted("only", StepAction::Halt, &journal)];
        let mut ctx = test_context();
        let _ = run_steps(&mut steps, &mut ctx);
        assert_eq!(*journal.lock().unwrap(), vec!["run:only", "cleanup:only"]);
    }

    #[test]
    fn recorded_error_is_surfaced() {
        struct Failing;
        impl Step for Failing {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
                ctx.halt(eyre!("ssh connect refused"))
            }
        }
        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(Failing)];
        let mut ctx = test_context();
        match run_steps(&mut steps, &mut ctx) {
            BuildOutcome::Failed(err) => {
                assert!(err.to_string().contains("ssh connect refused"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_skips_remaining_steps() {
        let journal = Arc::new(Mutex::new(Vec::new()));

        /// Cancels the build from "outside" during its own run.
        struct CancelDuringRun {
            journal: Arc<Mutex<Vec<String>>>,
        }
        impl Step for CancelDuringRun {
            fn name(&self) -> &'static str {
                "canceller"
            }
            fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
                self.journal.lock().unwrap().push("run:canceller".into());
                ctx.cancel.cancel();
                StepAction::Continue
            }
            fn cleanup(&mut self, _ctx: &mut BuildContext) {
                self.journal.lock().unwrap().push("cleanup:canceller".into());
            }
        }

        let mut steps: Vec<Box<dyn Step>> = vec![
            Box::new(CancelDuringRun {
                journal: journal.clone(),
            }),
            scripted("after", StepAction::Continue, &journal),
        ];
        let mut ctx = test_context();
        let outcome = run_steps(&mut steps, &mut ctx);
        assert!(matches!(outcome, BuildOutcome::Cancelled));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["run:canceller", "cleanup:canceller"]
        );
    }
}
