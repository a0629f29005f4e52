//! Expose the VM console as a plain local VNC endpoint.
//!
//! The console multiplexer wants TLS plus an HTTP upgrade before it talks
//! RFB; stock VNC viewers don't. A wrapper forwarding performs that
//! handshake on every backend connection, so anything pointed at the local
//! address sees a bare VNC server.

use std::sync::Arc;

use tracing::info;

use crate::console::{console_wrapper, console_location, tcp_address_from_url};
use crate::context::{BuildContext, HandoffKey, ServiceAddr};
use crate::engine::{Step, StepAction};
use crate::tunnel::{split_host_port, Forwarding};

/// Publishes a local plaintext VNC endpoint for the console.
#[derive(Default)]
pub struct StepForwardVnc {
    forwarding: Option<Box<dyn Forwarding>>,
}

impl std::fmt::Debug for StepForwardVnc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepForwardVnc")
            .field("active", &self.forwarding.is_some())
            .finish()
    }
}

impl Step for StepForwardVnc {
    fn name(&self) -> &'static str {
        "forward-vnc"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        if ctx.config.disable_vnc_forward {
            info!("VNC forwarding disabled by configuration");
            return StepAction::Continue;
        }

        let tunnel = match ctx.require_tunnel() {
            Ok(tunnel) => tunnel,
            Err(e) => return ctx.halt(e),
        };
        let client = Arc::clone(&ctx.client);
        let location = match console_location(&*client, &ctx.config.vm_name) {
            Ok(location) => location,
            Err(e) => return ctx.halt(e.wrap_err("resolving the VM console")),
        };
        let target = match tcp_address_from_url(&location) {
            Ok(target) => target,
            Err(e) => return ctx.halt(e),
        };
        let (host, port) = match split_host_port(&target) {
            Ok(parts) => parts,
            Err(e) => return ctx.halt(e),
        };

        let wrapper = console_wrapper(location, client.session_id());
        let mut forwarding = tunnel.create_wrapper_forwarding(host, port, wrapper);
        if let Err(e) = forwarding.start() {
            return ctx.halt(e.wrap_err("starting the VNC forwarding"));
        }
        let addr = ServiceAddr {
            host: forwarding.service_host(),
            port: forwarding.service_port(),
        };
        info!("VM console reachable at vnc://{addr}");
        ctx.publish_forward(HandoffKey::VncConsole, addr);
        self.forwarding = Some(forwarding);
        StepAction::Continue
    }

    fn cleanup(&mut self, _ctx: &mut BuildContext) {
        if let Some(mut forwarding) = self.forwarding.take() {
            forwarding.close();
        }
    }
}
