//! Orderly guest shutdown at the end of provisioning.

use std::time::Duration;

use tracing::{info, warn};

use crate::context::BuildContext;
use crate::controlplane::PowerState;
use crate::engine::{Step, StepAction};
use crate::wait::{WaitOutcome, Waiter};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Asks the guest to shut down cleanly and waits for it to halt.
///
/// A failed or overdue clean shutdown escalates to a hard power-off rather
/// than failing the build: the artifact is already provisioned at this
/// point and only the power state matters.
#[derive(Debug)]
pub struct StepShutdown {
    poll_interval: Duration,
}

impl Default for StepShutdown {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl StepShutdown {
    fn hard_off(&self, ctx: &mut BuildContext) -> StepAction {
        let instance = match ctx.require_instance() {
            Ok(instance) => instance,
            Err(e) => return ctx.halt(e),
        };
        if let Err(e) = ctx.client.hard_shutdown(&instance) {
            return ctx.halt(color_eyre::Report::new(e).wrap_err("forcing the VM off"));
        }
        StepAction::Continue
    }
}

impl Step for StepShutdown {
    fn name(&self) -> &'static str {
        "shutdown"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let instance = match ctx.require_instance() {
            Ok(instance) => instance,
            Err(e) => return ctx.halt(e),
        };

        info!("requesting clean shutdown");
        if let Err(e) = ctx.client.clean_shutdown(&instance) {
            warn!("clean shutdown failed ({e}), forcing the VM off");
            return self.hard_off(ctx);
        }

        let waiter = Waiter {
            timeout: ctx.config.shutdown_timeout(),
            interval: self.poll_interval,
        };
        let client = ctx.client.clone();
        let outcome = waiter.wait_until(&ctx.cancel.clone(), || {
            let state = client
                .power_state(&instance)
                .map_err(color_eyre::Report::new)?;
            Ok(state == PowerState::Halted)
        });
        match outcome {
            Ok(WaitOutcome::Done) => {
                info!("VM halted");
                StepAction::Continue
            }
            Ok(WaitOutcome::TimedOut) => {
                warn!(
                    "VM still running after {:?}, forcing it off",
                    ctx.config.shutdown_timeout()
                );
                self.hard_off(ctx)
            }
            Ok(WaitOutcome::Cancelled) => StepAction::Continue,
            Err(e) => ctx.halt(e.wrap_err("polling power state during shutdown")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::controlplane::tests_support::FakeControlPlane;
    use crate::controlplane::VmRef;
    use std::sync::Arc;

    fn test_context(timeout_secs: u64) -> (BuildContext, Arc<FakeControlPlane>) {
        let config = BuildConfig::from_toml(&format!(
            r#"
                vm_name = "target-vm"
                shutdown_timeout_secs = {timeout_secs}

                [remote]
                host = "mgmt.example"
                username = "root"
                password = "secret"
            "#
        ))
        .unwrap();
        let fake = Arc::new(FakeControlPlane {
            vm_name: "target-vm".into(),
            ..Default::default()
        });
        let mut ctx = BuildContext::new(config, fake.clone());
        ctx.instance = Some(VmRef("OpaqueRef:vm".into()));
        (ctx, fake)
    }

    fn quick_step() -> StepShutdown {
        StepShutdown {
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn clean_shutdown_completes_when_the_vm_halts() {
        let (mut ctx, fake) = test_context(10);
        *fake.power_states.lock().unwrap() = vec![PowerState::Running, PowerState::Halted];

        assert_eq!(quick_step().run(&mut ctx), StepAction::Continue);
        assert_eq!(fake.recorded_calls(), vec!["clean_shutdown:OpaqueRef:vm"]);
    }

    #[test]
    fn overdue_shutdown_escalates_to_hard_off() {
        let (mut ctx, fake) = test_context(0);
        *fake.power_states.lock().unwrap() = vec![PowerState::Running];

        assert_eq!(quick_step().run(&mut ctx), StepAction::Continue);
        assert_eq!(
            fake.recorded_calls(),
            vec!["clean_shutdown:OpaqueRef:vm", "hard_shutdown:OpaqueRef:vm"]
        );
    }

    #[test]
    fn cancellation_abandons_the_wait_without_forcing_off() {
        let (mut ctx, fake) = test_context(10);
        *fake.power_states.lock().unwrap() = vec![PowerState::Running];
        ctx.cancel.cancel();

        assert_eq!(quick_step().run(&mut ctx), StepAction::Continue);
        assert_eq!(fake.recorded_calls(), vec!["clean_shutdown:OpaqueRef:vm"]);
    }
}
