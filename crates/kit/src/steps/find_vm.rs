//! Resolve the VM under construction.

use std::sync::Arc;

use color_eyre::Report;
use tracing::info;

use crate::context::BuildContext;
use crate::controlplane::unique_vm_by_name;
use crate::engine::{Step, StepAction};

/// Looks the VM up by its configured name label and publishes its
/// reference and UUID. The name must be unique on the pool.
#[derive(Debug, Default)]
pub struct StepFindVm;

impl Step for StepFindVm {
    fn name(&self) -> &'static str {
        "find-vm"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let client = Arc::clone(&ctx.client);
        let vm = match unique_vm_by_name(&*client, &ctx.config.vm_name) {
            Ok(vm) => vm,
            Err(e) => {
                let err = Report::new(e)
                    .wrap_err(format!("looking up VM '{}'", ctx.config.vm_name));
                return ctx.halt(err);
            }
        };
        let uuid = match client.vm_uuid(&vm) {
            Ok(uuid) => uuid,
            Err(e) => return ctx.halt(e.into()),
        };
        info!("found VM '{}' ({uuid})", ctx.config.vm_name);
        ctx.instance = Some(vm);
        ctx.instance_uuid = Some(uuid);
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::controlplane::tests_support::FakeControlPlane;

    fn context_with(fake: FakeControlPlane) -> BuildContext {
        let config = BuildConfig::from_toml(
            r#"
                vm_name = "target-vm"

                [remote]
                host = "mgmt.example"
                username = "root"
                password = "secret"
            "#,
        )
        .unwrap();
        BuildContext::new(config, Arc::new(fake))
    }

    #[test]
    fn publishes_reference_and_uuid() {
        let mut ctx = context_with(FakeControlPlane {
            vm_name: "target-vm".into(),
            ..Default::default()
        });
        let action = StepFindVm.run(&mut ctx);
        assert_eq!(action, StepAction::Continue);
        assert!(ctx.instance.is_some());
        assert!(ctx.instance_uuid.is_some());
    }

    #[test]
    fn missing_vm_halts_with_a_name_diagnostic() {
        let mut ctx = context_with(FakeControlPlane::default());
        let action = StepFindVm.run(&mut ctx);
        assert_eq!(action, StepAction::Halt);
        let err = ctx.error.take().unwrap();
        assert!(err.to_string().contains("target-vm"));
    }
}
