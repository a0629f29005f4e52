//! Unpause the instance and give firmware a moment to reach the prompt.

use tracing::info;

use crate::context::BuildContext;
use crate::engine::{Step, StepAction};
use crate::wait::interruptible_sleep;

/// Releases the paused VM and waits the configured boot delay so the
/// installer's prompt is on screen before any typing starts.
#[derive(Debug, Default)]
pub struct StepBootWait;

impl Step for StepBootWait {
    fn name(&self) -> &'static str {
        "boot-wait"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = match ctx.require_instance() {
            Ok(vm) => vm,
            Err(e) => return ctx.halt(e),
        };
        if let Err(e) = ctx.client.unpause(&vm) {
            return ctx.halt(e.into());
        }
        let delay = ctx.config.boot_wait();
        info!("VM booting, waiting {delay:?} for the boot prompt");
        interruptible_sleep(delay, &ctx.cancel);
        StepAction::Continue
    }
}
