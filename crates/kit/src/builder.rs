//! Assembling and running the build pipeline.
//!
//! The pipeline is a fixed step sequence; variability lives in the
//! configuration each step consults and in the [`BuildHooks`] collaborators
//! the embedding program wires in (an install-media HTTP server, a media
//! VDI, an external cancellation signal).

use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tracing::info;

use crate::config::BuildConfig;
use crate::context::{BuildContext, HandoffKey};
use crate::controlplane::{ControlPlane, VbdKind};
use crate::engine::{run_steps, BuildOutcome, Step};
use crate::steps::{
    ForwardTarget, StepAttachVdi, StepBootWait, StepCreateForwarding, StepCreateTunnel,
    StepFindVm, StepForwardVnc, StepHttpIpDiscover, StepShutdown, StepStartVmPaused,
    StepTypeBootCommand, StepWaitForIp,
};
use crate::wait::CancelToken;

/// An install-media VDI to attach for the duration of the build.
#[derive(Debug, Clone)]
pub struct MediaAttachment {
    /// UUID of the VDI on the hypervisor host.
    pub vdi_uuid: String,
    /// How to attach it.
    pub kind: VbdKind,
}

/// External collaborators wired into one build run.
#[derive(Default)]
pub struct BuildHooks {
    /// Source IPs of guest requests observed by the install-media HTTP
    /// server, for HTTP-based IP discovery.
    pub http_hits: Option<Receiver<String>>,
    /// Port of the install-media HTTP server, interpolated into boot
    /// commands as `{{ .HTTPPort }}`.
    pub http_port: Option<u16>,
    /// Media VDI to attach before the VM starts.
    pub media: Option<MediaAttachment>,
    /// Externally owned cancellation flag (a signal handler's, usually).
    pub cancel: Option<CancelToken>,
}

impl fmt::Debug for BuildHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildHooks")
            .field("http_hits", &self.http_hits.is_some())
            .field("http_port", &self.http_port)
            .field("media", &self.media)
            .finish_non_exhaustive()
    }
}

/// The build pipeline, in execution order.
pub fn plan_steps(hooks: &mut BuildHooks) -> Vec<Box<dyn Step>> {
    let mut steps: Vec<Box<dyn Step>> = vec![
        Box::new(StepCreateTunnel),
        Box::new(StepHttpIpDiscover),
        Box::new(StepFindVm),
    ];
    if let Some(media) = hooks.media.take() {
        steps.push(Box::new(StepAttachVdi::new(media.vdi_uuid, media.kind)));
    }
    steps.push(Box::new(StepStartVmPaused::default()));
    steps.push(Box::new(StepBootWait));
    steps.push(Box::new(StepForwardVnc::default()));
    steps.push(Box::new(StepTypeBootCommand));
    steps.push(Box::new(StepWaitForIp::new(hooks.http_hits.take())));
    steps.push(Box::new(StepCreateForwarding::new(vec![
        ForwardTarget::communicator(),
    ])));
    steps.push(Box::new(StepShutdown::default()));
    steps
}

/// Run the full pipeline against `client`.
///
/// The returned context carries whatever the run produced (the guest IP,
/// forwarded addresses, the first error) alongside the outcome.
pub fn run_build(
    config: BuildConfig,
    client: Arc<dyn ControlPlane>,
    mut hooks: BuildHooks,
) -> (BuildOutcome, BuildContext) {
    let mut ctx = BuildContext::new(config, client);
    ctx.http_port = hooks.http_port;
    if let Some(cancel) = hooks.cancel.take() {
        ctx.cancel = cancel;
    }

    let mut steps = plan_steps(&mut hooks);
    let outcome = run_steps(&mut steps, &mut ctx);

    if let BuildOutcome::Completed = outcome {
        if let Some(addr) = ctx.forwarded(&HandoffKey::Communicator) {
            info!("provisioned VM reachable at {addr}");
        }
    }
    (outcome, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::controlplane::tests_support::FakeControlPlane;
    use crate::controlplane::PowerState;
    use std::collections::HashMap;

    fn offline_config() -> BuildConfig {
        // Direct mode with everything network-touching disabled or skipped,
        // so the whole pipeline runs against the fake control plane.
        BuildConfig::from_toml(
            r#"
                vm_name = "target-vm"
                skip_nat_mapping = true
                http_address = "192.0.2.10"
                disable_vnc_forward = true
                boot_wait_secs = 0
                ip_source = "tools"
                comm_port = 22

                [remote]
                host = "mgmt.example"
                username = "root"
                password = "secret"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn pipeline_order_is_fixed() {
        let mut hooks = BuildHooks {
            media: Some(MediaAttachment {
                vdi_uuid: "iso-uuid".into(),
                kind: VbdKind::Cd,
            }),
            ..Default::default()
        };
        let names: Vec<_> = plan_steps(&mut hooks).iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "create-tunnel",
                "http-ip-discover",
                "find-vm",
                "attach-vdi",
                "start-vm",
                "boot-wait",
                "forward-vnc",
                "type-boot-command",
                "wait-for-ip",
                "create-forwarding",
                "shutdown",
            ]
        );
    }

    #[test]
    fn full_run_completes_against_a_scripted_control_plane() {
        let fake = Arc::new(FakeControlPlane {
            vm_name: "target-vm".into(),
            ..Default::default()
        });
        *fake.networks.lock().unwrap() = vec![Some(HashMap::from([(
            "0/ip".to_string(),
            "10.0.0.7".to_string(),
        )]))];
        *fake.power_states.lock().unwrap() = vec![PowerState::Halted];

        let (outcome, ctx) = run_build(offline_config(), fake.clone(), BuildHooks::default());

        assert!(matches!(outcome, BuildOutcome::Completed), "{outcome:?}");
        assert_eq!(ctx.instance_ip.as_deref(), Some("10.0.0.7"));
        let addr = ctx.forwarded(&HandoffKey::Communicator).unwrap();
        assert_eq!(addr.host, "10.0.0.7");
        assert_eq!(addr.port, 22);
        assert_eq!(
            fake.recorded_calls(),
            vec![
                "start_paused:OpaqueRef:vm",
                "unpause:OpaqueRef:vm",
                "clean_shutdown:OpaqueRef:vm",
            ]
        );
    }

    #[test]
    fn cancellation_before_the_first_step_reports_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let hooks = BuildHooks {
            cancel: Some(cancel),
            ..Default::default()
        };
        let (outcome, _ctx) = run_build(
            offline_config(),
            Arc::new(FakeControlPlane {
                vm_name: "target-vm".into(),
                ..Default::default()
            }),
            hooks,
        );
        assert!(matches!(outcome, BuildOutcome::Cancelled), "{outcome:?}");
    }
}
