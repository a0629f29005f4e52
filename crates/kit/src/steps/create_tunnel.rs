//! Stand up the tunnel into the guest network.

use tracing::info;

use crate::context::BuildContext;
use crate::engine::{Step, StepAction};
use crate::tunnel::create_tunnel;

/// Opens the SSH session and the local SOCKS front (or the direct
/// passthrough when NAT bridging is skipped) and publishes the tunnel
/// handle for every later phase.
#[derive(Debug, Default)]
pub struct StepCreateTunnel;

impl Step for StepCreateTunnel {
    fn name(&self) -> &'static str {
        "create-tunnel"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let tunnel = match create_tunnel(ctx.config.skip_nat_mapping, &ctx.config.remote) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                return ctx.halt(e.wrap_err(format!(
                    "connecting to the hypervisor host {}",
                    ctx.config.remote.host
                )))
            }
        };
        if let Err(e) = tunnel.start() {
            tunnel.close();
            return ctx.halt(e.wrap_err("starting the tunnel proxy"));
        }
        match tunnel.socks_addr() {
            Some(addr) => info!("tunnel proxy listening on socks5://{addr}"),
            None => info!("direct connections to the guest network"),
        }
        ctx.tunnel = Some(tunnel);
        StepAction::Continue
    }

    fn cleanup(&mut self, ctx: &mut BuildContext) {
        if let Some(tunnel) = ctx.tunnel.take() {
            tunnel.close();
        }
    }
}
