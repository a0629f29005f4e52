//! Resolve the installed guest's IP address.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::context::BuildContext;
use crate::engine::{Step, StepAction};
use crate::ip_discovery::wait_for_ip;
use crate::wait::Waiter;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Races the configured discovery sources and publishes the guest IP.
pub struct StepWaitForIp {
    http_hits: Option<Receiver<String>>,
}

impl std::fmt::Debug for StepWaitForIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepWaitForIp")
            .field("http_source", &self.http_hits.is_some())
            .finish()
    }
}

impl StepWaitForIp {
    /// `http_hits` carries the source IP of guest HTTP requests, fed by
    /// the install-media server; pass `None` when no server runs.
    pub fn new(http_hits: Option<Receiver<String>>) -> Self {
        Self { http_hits }
    }
}

impl Step for StepWaitForIp {
    fn name(&self) -> &'static str {
        "wait-for-ip"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = match ctx.require_instance() {
            Ok(vm) => vm,
            Err(e) => return ctx.halt(e),
        };
        let client = Arc::clone(&ctx.client);
        let waiter = Waiter {
            timeout: ctx.config.ip_wait_timeout(),
            interval: POLL_INTERVAL,
        };
        info!(
            "waiting up to {:?} for the guest IP (source: {})",
            waiter.timeout, ctx.config.ip_source
        );
        match wait_for_ip(
            &*client,
            &vm,
            ctx.config.ip_source,
            self.http_hits.as_ref(),
            waiter,
            &ctx.cancel,
        ) {
            Ok(ip) => {
                info!("guest reachable at {ip}");
                ctx.instance_ip = Some(ip);
                StepAction::Continue
            }
            Err(e) => ctx.halt(e),
        }
    }
}
