//! Start the instance, paused.
//!
//! Starting paused lets the console forwarding and boot-command machinery
//! get into place before the guest executes its first instruction; the
//! boot-wait step unpauses.

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::BuildContext;
use crate::controlplane::PowerState;
use crate::engine::{Step, StepAction};

/// Starts the instance paused; unwind powers it back off unless the
/// keep-VM policy applies.
#[derive(Debug, Default)]
pub struct StepStartVmPaused {
    started: bool,
}

impl Step for StepStartVmPaused {
    fn name(&self) -> &'static str {
        "start-vm"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = match ctx.require_instance() {
            Ok(vm) => vm,
            Err(e) => return ctx.halt(e),
        };
        if let Err(e) = ctx.client.start_paused(&vm) {
            return ctx.halt(e.into());
        }
        info!("VM started (paused)");
        self.started = true;
        StepAction::Continue
    }

    fn cleanup(&mut self, ctx: &mut BuildContext) {
        if !self.started {
            return;
        }
        if ctx.should_keep_instance() {
            info!("keeping the VM running per keep_instance policy");
            return;
        }
        let Some(vm) = ctx.instance.clone() else { return };
        let client = Arc::clone(&ctx.client);
        match client.power_state(&vm) {
            Ok(PowerState::Halted) => {}
            Ok(_) => {
                if let Err(e) = client.hard_shutdown(&vm) {
                    warn!("powering the VM back off: {e}");
                }
            }
            Err(e) => warn!("querying VM power state during unwind: {e}"),
        }
    }
}
