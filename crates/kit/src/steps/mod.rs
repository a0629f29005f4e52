//! Build phases, in the order the engine runs them.
//!
//! Each step stashes on itself whatever its own cleanup needs to undo, so
//! the engine's reverse unwind reclaims exactly what was created no matter
//! how far the pipeline got.

mod attach_vdi;
mod boot_wait;
mod create_forwarding;
mod create_tunnel;
mod find_vm;
mod forward_vnc;
mod http_ip_discover;
mod shutdown;
mod start_vm;
mod type_boot_command;
mod wait_for_ip;

pub use attach_vdi::StepAttachVdi;
pub use boot_wait::StepBootWait;
pub use create_forwarding::{ForwardTarget, StepCreateForwarding};
pub use create_tunnel::StepCreateTunnel;
pub use find_vm::StepFindVm;
pub use forward_vnc::StepForwardVnc;
pub use http_ip_discover::StepHttpIpDiscover;
pub use shutdown::StepShutdown;
pub use start_vm::StepStartVmPaused;
pub use type_boot_command::StepTypeBootCommand;
pub use wait_for_ip::StepWaitForIp;
