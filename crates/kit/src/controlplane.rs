//! Interface to the hypervisor control plane.
//!
//! The control plane is an external collaborator: a typed RPC client bound to
//! an authenticated session on the management host. This module defines only
//! the surface the build pipeline consumes; concrete clients live with the
//! host integration.

use std::collections::HashMap;

/// Errors surfaced by control-plane calls.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// The RPC itself failed (transport or server-side fault).
    #[error("control plane call failed: {0}")]
    Rpc(String),
    /// A referenced object does not exist (or no longer exists).
    #[error("control plane object not found: {0}")]
    NotFound(String),
    /// The query matched an unexpected number of objects.
    #[error("expected exactly one {kind}, found {count}")]
    NotUnique {
        /// Object kind being looked up (e.g. "VM", "console").
        kind: &'static str,
        /// Number of matches actually returned.
        count: usize,
    },
}

/// Result alias for control-plane calls.
pub type CpResult<T> = Result<T, ControlPlaneError>;

/// Opaque reference to a VM object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmRef(pub String);

/// Opaque reference to a console object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsoleRef(pub String);

/// Opaque reference to a virtual disk image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VdiRef(pub String);

/// Opaque reference to a virtual block device (a VDI attachment).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VbdRef(pub String);

/// VM power states as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PowerState {
    /// VM exists but is not running.
    Halted,
    /// VM is running but execution is paused.
    Paused,
    /// VM is running.
    Running,
    /// VM state has been written to disk.
    Suspended,
}

/// How a VDI is attached to a VM.
///
/// The kind fixes mode and bootability: CDs attach read-only and bootable,
/// disks read-write, floppies read-write and unpluggable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbdKind {
    /// Read-only, bootable (installation media).
    Cd,
    /// Read-write data disk.
    Disk,
    /// Read-write, unpluggable.
    Floppy,
}

/// The subset of the hypervisor management API the pipeline consumes.
///
/// All calls are synchronous and fallible. Implementations hold one
/// authenticated session reference which is shared read-only by every step;
/// it is never mutated after construction.
pub trait ControlPlane: Send + Sync {
    /// The session token of the authenticated connection, used as the
    /// console handshake credential.
    fn session_id(&self) -> String;

    /// Look up VMs by their human-readable name label.
    fn vm_by_name_label(&self, name: &str) -> CpResult<Vec<VmRef>>;

    /// Look up a VM by UUID.
    fn vm_by_uuid(&self, uuid: &str) -> CpResult<VmRef>;

    /// The UUID of a VM reference.
    fn vm_uuid(&self, vm: &VmRef) -> CpResult<String>;

    /// Consoles attached to a VM.
    fn vm_consoles(&self, vm: &VmRef) -> CpResult<Vec<ConsoleRef>>;

    /// The location URL of a console (the console multiplexer endpoint).
    fn console_location(&self, console: &ConsoleRef) -> CpResult<String>;

    /// Current power state of a VM.
    fn power_state(&self, vm: &VmRef) -> CpResult<PowerState>;

    /// Network metadata reported by in-guest tooling, as a map of metadata
    /// keys (e.g. `0/ip`, `0/ipv4/0`) to addresses. `None` when the guest
    /// has not reported anything yet.
    fn guest_metrics_networks(&self, vm: &VmRef) -> CpResult<Option<HashMap<String, String>>>;

    /// Start a VM in the paused state.
    fn start_paused(&self, vm: &VmRef) -> CpResult<()>;

    /// Unpause a paused VM.
    fn unpause(&self, vm: &VmRef) -> CpResult<()>;

    /// Ask the guest to shut down cleanly. Requires in-guest tooling.
    fn clean_shutdown(&self, vm: &VmRef) -> CpResult<()>;

    /// Force the VM off.
    fn hard_shutdown(&self, vm: &VmRef) -> CpResult<()>;

    /// Look up a VDI by UUID.
    fn vdi_by_uuid(&self, uuid: &str) -> CpResult<VdiRef>;

    /// Attach a VDI to a VM, returning the created attachment.
    fn attach_vdi(&self, vm: &VmRef, vdi: &VdiRef, kind: VbdKind) -> CpResult<VbdRef>;

    /// Detach a previously created attachment.
    fn detach_vdi(&self, vbd: &VbdRef) -> CpResult<()>;
}

/// Resolve the unique VM carrying `name`, failing when the name is missing
/// or ambiguous.
pub fn unique_vm_by_name(client: &dyn ControlPlane, name: &str) -> CpResult<VmRef> {
    let mut refs = client.vm_by_name_label(name)?;
    match refs.len() {
        1 => Ok(refs.remove(0)),
        n => Err(ControlPlaneError::NotUnique {
            kind: "VM",
            count: n,
        }),
    }
}
