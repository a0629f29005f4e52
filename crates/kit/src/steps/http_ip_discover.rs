//! Learn the automation host's address on the management network.
//!
//! Boot commands interpolate `{{ .HTTPIP }}` so the guest can fetch
//! kickstart files from the install-media HTTP server. When the operator
//! did not pin an address, the management host itself knows best where our
//! SSH connection came from: `$SSH_CLIENT` on the far side.

use color_eyre::eyre::eyre;
use tracing::info;

use crate::context::BuildContext;
use crate::engine::{Step, StepAction};
use crate::tunnel::ssh::exec_host_command;

/// Publishes the HTTP server address the guest should use.
#[derive(Debug, Default)]
pub struct StepHttpIpDiscover;

impl Step for StepHttpIpDiscover {
    fn name(&self) -> &'static str {
        "http-ip-discover"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        if let Some(address) = &ctx.config.http_address {
            info!("using configured HTTP address {address}");
            ctx.http_ip = Some(address.clone());
            return StepAction::Continue;
        }

        let output = match exec_host_command(&ctx.config.remote, "echo $SSH_CLIENT") {
            Ok(output) => output,
            Err(e) => return ctx.halt(e.wrap_err("asking the hypervisor host for our address")),
        };
        let Some(ip) = output.split_whitespace().next().map(str::to_string) else {
            return ctx.halt(eyre!(
                "the hypervisor host reported an empty SSH_CLIENT; set http_address explicitly"
            ));
        };
        info!("management network sees this host as {ip}");
        ctx.http_ip = Some(ip);
        StepAction::Continue
    }
}
