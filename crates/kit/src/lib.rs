//! Unattended VM provisioning against a guest-only hypervisor network.
//!
//! The automation host can reach exactly one endpoint: the hypervisor
//! management host, over SSH. Everything else (the VM console, the guest
//! itself) is bridged through that single connection: a local SOCKS5
//! proxy for dials, local port forwardings for protocol-unaware clients,
//! and a TLS console bridge that types boot commands over RFB.
//!
//! [`builder::run_build`] runs the whole pipeline; the individual pieces
//! (tunnel, console, discovery, step engine) are usable on their own.

pub mod boot_command;
pub mod builder;
pub mod config;
pub mod console;
pub mod context;
pub mod controlplane;
pub mod engine;
pub mod ip_discovery;
pub mod rfb;
pub mod steps;
pub mod tunnel;
pub mod wait;
