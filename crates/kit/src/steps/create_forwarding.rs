//! Forwardings to targets that are only known at runtime.
//!
//! The provisioning communicator wants a connectable address before the
//! guest IP exists, so targets carry deferred host/port resolvers that run
//! against the context once earlier steps have published what they need.

use tracing::{debug, info};

use crate::context::{BuildContext, HandoffKey, ServiceAddr};
use crate::engine::{Step, StepAction};
use crate::tunnel::Forwarding;

/// Resolves a value for a forwarding target from the build context.
pub type Resolver<T> = Box<dyn Fn(&BuildContext) -> color_eyre::Result<T> + Send>;

/// A forwarding to create once its target can be resolved.
pub struct ForwardTarget {
    /// Handoff key the service-side address is published under.
    pub key: HandoffKey,
    host: Resolver<String>,
    port: Resolver<u16>,
}

impl std::fmt::Debug for ForwardTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardTarget")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl ForwardTarget {
    /// Target with explicit resolvers.
    pub fn new(key: HandoffKey, host: Resolver<String>, port: Resolver<u16>) -> Self {
        Self { key, host, port }
    }

    /// The provisioning-communicator target: the discovered guest IP on
    /// the configured communicator port.
    pub fn communicator() -> Self {
        Self::new(
            HandoffKey::Communicator,
            Box::new(|ctx: &BuildContext| {
                ctx.instance_ip
                    .clone()
                    .ok_or_else(|| color_eyre::eyre::eyre!("the guest IP has not been discovered"))
            }),
            Box::new(|ctx: &BuildContext| Ok(ctx.config.comm_port)),
        )
    }
}

/// Creates one forwarding per target and publishes each service address.
///
/// Any resolver or start failure unwinds the forwardings already created
/// and halts; a partially forwarded build is not provisionable.
pub struct StepCreateForwarding {
    targets: Vec<ForwardTarget>,
    forwardings: Vec<Box<dyn Forwarding>>,
}

impl std::fmt::Debug for StepCreateForwarding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCreateForwarding")
            .field("targets", &self.targets)
            .field("active", &self.forwardings.len())
            .finish()
    }
}

impl StepCreateForwarding {
    /// Forwardings for `targets`, created when the step runs.
    pub fn new(targets: Vec<ForwardTarget>) -> Self {
        Self {
            targets,
            forwardings: Vec::new(),
        }
    }

    fn close_all(&mut self) {
        for mut forwarding in self.forwardings.drain(..).rev() {
            forwarding.close();
        }
    }
}

impl Step for StepCreateForwarding {
    fn name(&self) -> &'static str {
        "create-forwarding"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let tunnel = match ctx.require_tunnel() {
            Ok(tunnel) => tunnel,
            Err(e) => return ctx.halt(e),
        };

        for target in std::mem::take(&mut self.targets) {
            let host = match (target.host)(ctx) {
                Ok(host) => host,
                Err(e) => {
                    self.close_all();
                    return ctx.halt(e.wrap_err(format!(
                        "resolving forwarding host for {:?}",
                        target.key
                    )));
                }
            };
            let port = match (target.port)(ctx) {
                Ok(port) => port,
                Err(e) => {
                    self.close_all();
                    return ctx.halt(e.wrap_err(format!(
                        "resolving forwarding port for {:?}",
                        target.key
                    )));
                }
            };
            let mut forwarding = tunnel.create_forwarding(host.clone(), port);
            if let Err(e) = forwarding.start() {
                self.close_all();
                return ctx.halt(e.wrap_err(format!("forwarding to {host}:{port}")));
            }
            let addr = ServiceAddr {
                host: forwarding.service_host(),
                port: forwarding.service_port(),
            };
            info!("forwarding {addr} -> {host}:{port} ({:?})", target.key);
            ctx.publish_forward(target.key, addr);
            self.forwardings.push(forwarding);
        }
        StepAction::Continue
    }

    fn cleanup(&mut self, _ctx: &mut BuildContext) {
        if !self.forwardings.is_empty() {
            debug!("closing {} forwarding(s)", self.forwardings.len());
        }
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::controlplane::tests_support::FakeControlPlane;
    use crate::tunnel::DirectTunnel;
    use std::sync::Arc;

    fn test_context() -> BuildContext {
        let config = BuildConfig::from_toml(
            r#"
                vm_name = "target-vm"
                comm_port = 5985

                [remote]
                host = "mgmt.example"
                username = "root"
                password = "secret"
            "#,
        )
        .unwrap();
        let mut ctx = BuildContext::new(config, Arc::new(FakeControlPlane::default()));
        ctx.tunnel = Some(Arc::new(DirectTunnel));
        ctx
    }

    #[test]
    fn resolved_targets_are_published_under_their_keys() {
        let mut ctx = test_context();
        ctx.instance_ip = Some("172.16.9.2".into());

        let mut step = StepCreateForwarding::new(vec![ForwardTarget::communicator()]);
        assert_eq!(step.run(&mut ctx), StepAction::Continue);

        // Direct mode reports the target itself as the service address.
        let addr = ctx.forwarded(&HandoffKey::Communicator).unwrap();
        assert_eq!(addr.host, "172.16.9.2");
        assert_eq!(addr.port, 5985);

        step.cleanup(&mut ctx);
    }

    #[test]
    fn resolver_failure_halts_with_the_target_key() {
        let mut ctx = test_context();
        // No instance IP discovered.
        let mut step = StepCreateForwarding::new(vec![ForwardTarget::communicator()]);
        assert_eq!(step.run(&mut ctx), StepAction::Halt);
        let err = ctx.error.take().unwrap();
        assert!(err.to_string().contains("Communicator"));
        assert!(ctx.forwarded(&HandoffKey::Communicator).is_none());
    }
}
