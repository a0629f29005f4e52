//! Type the boot command into the VM console.

use std::sync::Arc;

use tracing::{debug, info};

use crate::boot_command::{parse_boot_command, render, type_sequence, TemplateData};
use crate::console::{connect_console, console_location};
use crate::context::BuildContext;
use crate::engine::{Step, StepAction};
use crate::rfb::RfbClient;

/// Drives the unattended installer's prompt over the console bridge.
///
/// There is no retry: a boot prompt is not idempotently resumable
/// mid-sequence, so any failure here halts the build.
#[derive(Debug, Default)]
pub struct StepTypeBootCommand;

impl Step for StepTypeBootCommand {
    fn name(&self) -> &'static str {
        "type-boot-command"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let command = ctx.config.flat_boot_command();
        if command.is_empty() {
            debug!("no boot command configured, skipping");
            return StepAction::Continue;
        }

        let data = TemplateData {
            name: ctx.config.vm_name.clone(),
            http_ip: ctx.http_ip.clone().unwrap_or_default(),
            http_port: ctx.http_port.unwrap_or(0),
        };
        let actions = match parse_boot_command(&render(&command, &data)) {
            Ok(actions) => actions,
            Err(e) => return ctx.halt(e.wrap_err("preparing the boot command")),
        };

        let tunnel = match ctx.require_tunnel() {
            Ok(tunnel) => tunnel,
            Err(e) => return ctx.halt(e),
        };
        let client = Arc::clone(&ctx.client);
        let location = match console_location(&*client, &ctx.config.vm_name) {
            Ok(location) => location,
            Err(e) => return ctx.halt(e.wrap_err("resolving the VM console")),
        };
        info!("connecting to the VM console at {location}");
        let stream = match connect_console(&*tunnel, &location, &client.session_id()) {
            Ok(stream) => stream,
            Err(e) => return ctx.halt(e.wrap_err("connecting to the VM console")),
        };
        let mut rfb = match RfbClient::handshake(stream) {
            Ok(rfb) => rfb,
            Err(e) => return ctx.halt(e.wrap_err("negotiating the VNC session")),
        };
        debug!("connected to console desktop '{}'", rfb.desktop_name());

        info!("typing the boot command over VNC");
        let interval = ctx.config.boot_key_interval();
        if let Err(e) = type_sequence(&mut rfb, &actions, interval, &ctx.cancel) {
            return ctx.halt(e.wrap_err("typing the boot command"));
        }
        info!("finished typing");
        StepAction::Continue
    }
}
