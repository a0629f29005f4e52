//! Attach installation media or an extra disk to the instance.

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::BuildContext;
use crate::controlplane::{VbdKind, VbdRef};
use crate::engine::{Step, StepAction};

/// Attaches a VDI by UUID and detaches exactly that attachment on unwind.
#[derive(Debug)]
pub struct StepAttachVdi {
    vdi_uuid: String,
    kind: VbdKind,
    vbd: Option<VbdRef>,
}

impl StepAttachVdi {
    /// Attachment of the VDI carrying `vdi_uuid` as `kind`.
    pub fn new(vdi_uuid: String, kind: VbdKind) -> Self {
        Self {
            vdi_uuid,
            kind,
            vbd: None,
        }
    }
}

impl Step for StepAttachVdi {
    fn name(&self) -> &'static str {
        "attach-vdi"
    }

    fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let vm = match ctx.require_instance() {
            Ok(vm) => vm,
            Err(e) => return ctx.halt(e),
        };
        let client = Arc::clone(&ctx.client);
        let vdi = match client.vdi_by_uuid(&self.vdi_uuid) {
            Ok(vdi) => vdi,
            Err(e) => return ctx.halt(e.into()),
        };
        match client.attach_vdi(&vm, &vdi, self.kind) {
            Ok(vbd) => {
                info!("attached VDI {} as {:?}", self.vdi_uuid, self.kind);
                self.vbd = Some(vbd);
                StepAction::Continue
            }
            Err(e) => ctx.halt(e.into()),
        }
    }

    fn cleanup(&mut self, ctx: &mut BuildContext) {
        // Nothing to undo when run never attached.
        let Some(vbd) = self.vbd.take() else { return };
        if ctx.should_keep_instance() {
            info!("keeping VM, leaving VDI {} attached", self.vdi_uuid);
            return;
        }
        if let Err(e) = ctx.client.detach_vdi(&vbd) {
            warn!("detaching VDI {}: {e}", self.vdi_uuid);
        }
    }
}
