//! Shared build state threaded through step execution.
//!
//! The context is a typed replacement for a stringly-keyed state bag: every
//! cross-step handoff is either a named field or an entry in the enumerated
//! [`HandoffKey`] map. The foreground engine thread is the only writer;
//! background tasks receive `Arc` clones of the specific values they need.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use color_eyre::Report;
use tracing::error;

use crate::config::BuildConfig;
use crate::controlplane::{ControlPlane, VmRef};
use crate::engine::StepAction;
use crate::tunnel::Tunnel;
use crate::wait::CancelToken;

/// Keys for dynamic step-to-step handoffs of forwarded service addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandoffKey {
    /// Local endpoint the provisioning communicator should connect to.
    Communicator,
    /// Local plaintext VNC endpoint for the VM console.
    VncConsole,
}

/// A locally reachable host/port pair published by a forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddr {
    /// Host to connect to. A loopback IP for real forwardings; the remote
    /// target itself when NAT bridging is disabled.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
}

impl fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Mutable state shared by all steps of one build run.
pub struct BuildContext {
    /// Resolved build configuration.
    pub config: BuildConfig,
    /// Control-plane client, shared read-only.
    pub client: Arc<dyn ControlPlane>,
    /// The tunnel proxy, once the proxy step has published it.
    pub tunnel: Option<Arc<dyn Tunnel>>,
    /// The VM instance under construction.
    pub instance: Option<VmRef>,
    /// UUID of the instance.
    pub instance_uuid: Option<String>,
    /// Guest IP learned by discovery.
    pub instance_ip: Option<String>,
    /// Automation-host address as seen from the management network.
    pub http_ip: Option<String>,
    /// Port of the collaborating install-media HTTP server, when one runs.
    pub http_port: Option<u16>,
    /// First fatal error recorded by a step.
    pub error: Option<Report>,
    /// Cancellation flag observed by waits and the engine.
    pub cancel: CancelToken,
    forwarded: HashMap<HandoffKey, ServiceAddr>,
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("vm_name", &self.config.vm_name)
            .field("instance_uuid", &self.instance_uuid)
            .field("instance_ip", &self.instance_ip)
            .field("http_ip", &self.http_ip)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .field("forwarded", &self.forwarded)
            .finish_non_exhaustive()
    }
}

impl BuildContext {
    /// Fresh context for one build run.
    pub fn new(config: BuildConfig, client: Arc<dyn ControlPlane>) -> Self {
        Self {
            config,
            client,
            tunnel: None,
            instance: None,
            instance_uuid: None,
            instance_ip: None,
            http_ip: None,
            http_port: None,
            error: None,
            cancel: CancelToken::new(),
            forwarded: HashMap::new(),
        }
    }

    /// Record the first fatal error. Later errors are logged but the first
    /// one is what the engine surfaces.
    pub fn fail(&mut self, err: Report) {
        error!("{err:#}");
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Record a fatal error and halt the pipeline. Convenience for the
    /// ubiquitous error exit in step bodies.
    pub fn halt(&mut self, err: Report) -> StepAction {
        self.fail(err);
        StepAction::Halt
    }

    /// The tunnel handle, which proxy-dependent steps require.
    pub fn require_tunnel(&self) -> color_eyre::Result<Arc<dyn Tunnel>> {
        self.tunnel
            .clone()
            .ok_or_else(|| color_eyre::eyre::eyre!("tunnel proxy has not been created yet"))
    }

    /// The instance reference, which post-creation steps require.
    pub fn require_instance(&self) -> color_eyre::Result<VmRef> {
        self.instance
            .clone()
            .ok_or_else(|| color_eyre::eyre::eyre!("VM instance has not been resolved yet"))
    }

    /// Publish a forwarded service address for later steps.
    pub fn publish_forward(&mut self, key: HandoffKey, addr: ServiceAddr) {
        self.forwarded.insert(key, addr);
    }

    /// Look up a previously published forwarded address.
    pub fn forwarded(&self, key: &HandoffKey) -> Option<&ServiceAddr> {
        self.forwarded.get(key)
    }

    /// Whether the instance should survive unwind, given the current
    /// error/cancellation state.
    pub fn should_keep_instance(&self) -> bool {
        use crate::config::KeepInstance;
        match self.config.keep_instance {
            KeepInstance::Always => true,
            KeepInstance::Never => false,
            KeepInstance::OnFailure => self.error.is_some() || self.cancel.is_cancelled(),
        }
    }
}
