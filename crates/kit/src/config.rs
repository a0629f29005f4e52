//! Build configuration.
//!
//! Deserialized from TOML by the CLI; host integrations may also construct
//! it directly. Only the runtime control/networking knobs live here; the
//! hypervisor resource model (disks, templates, networks) belongs to the
//! collaborating control-plane client.

use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::boot_command::parse_boot_command;
use crate::ip_discovery::IpSource;

/// When the built VM instance should be kept around instead of destroyed
/// during unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeepInstance {
    /// Always destroy the instance on unwind.
    #[default]
    Never,
    /// Keep the instance when the build failed (for debugging).
    OnFailure,
    /// Always keep the instance.
    Always,
}

/// Connection details for the hypervisor management host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// Management host to connect to (the only reachable endpoint).
    pub host: String,
    /// SSH port on the management host.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// SSH username.
    pub username: String,
    /// SSH password. Mutually exclusive with `private_key_path`. Never
    /// re-serialized.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Path to an SSH private key file.
    #[serde(default)]
    pub private_key_path: Option<Utf8PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Top-level build configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    /// Name label of the VM instance being built. Must be unique on the
    /// pool for console lookup to succeed.
    pub vm_name: String,

    /// Management host connection.
    pub remote: RemoteConfig,

    /// Skip the SSH/SOCKS bridging layer entirely and dial guests
    /// directly. Only valid when the guest network is routable from the
    /// automation host.
    #[serde(default)]
    pub skip_nat_mapping: bool,

    /// Where the guest IP is learned from.
    #[serde(default)]
    pub ip_source: IpSource,

    /// Overall bound on IP discovery, in seconds.
    #[serde(default = "default_ip_wait_timeout")]
    pub ip_wait_timeout_secs: u64,

    /// Delay after unpausing the VM before console interaction, in seconds.
    #[serde(default = "default_boot_wait")]
    pub boot_wait_secs: u64,

    /// Keystroke sequence answering the unattended-install boot prompt.
    /// Segments are concatenated before interpolation.
    #[serde(default)]
    pub boot_command: Vec<String>,

    /// Pause between injected key events, in milliseconds.
    #[serde(default = "default_boot_key_interval")]
    pub boot_key_interval_ms: u64,

    /// Bound on waiting for the guest to reach the halted state, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Address the guest should use to reach the install-media HTTP server.
    /// When unset it is discovered from the management host's view of the
    /// SSH client address.
    #[serde(default)]
    pub http_address: Option<String>,

    /// Do not expose the VM console as a local VNC endpoint.
    #[serde(default)]
    pub disable_vnc_forward: bool,

    /// Guest port the provisioning communicator connects to.
    #[serde(default = "default_comm_port")]
    pub comm_port: u16,

    /// Instance retention policy during unwind.
    #[serde(default)]
    pub keep_instance: KeepInstance,
}

fn default_ip_wait_timeout() -> u64 {
    300
}

fn default_boot_wait() -> u64 {
    10
}

fn default_boot_key_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    300
}

fn default_comm_port() -> u16 {
    22
}

impl BuildConfig {
    /// Parse a TOML document into a validated configuration.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: BuildConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.vm_name.trim().is_empty() {
            bail!("vm_name must not be empty");
        }
        if self.remote.host.trim().is_empty() {
            bail!("remote.host must not be empty");
        }
        match (&self.remote.password, &self.remote.private_key_path) {
            (None, None) => {
                bail!("either remote.password or remote.private_key_path is required")
            }
            (Some(_), Some(_)) => {
                bail!("remote.password and remote.private_key_path are mutually exclusive")
            }
            _ => {}
        }
        // Surface boot command syntax errors at config time, not mid-install.
        parse_boot_command(&self.flat_boot_command())?;
        Ok(())
    }

    /// The boot command segments joined into one sequence.
    pub fn flat_boot_command(&self) -> String {
        self.boot_command.concat()
    }

    /// IP discovery bound as a [`Duration`].
    pub fn ip_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_wait_timeout_secs)
    }

    /// Boot delay as a [`Duration`].
    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }

    /// Key event pacing as a [`Duration`].
    pub fn boot_key_interval(&self) -> Duration {
        Duration::from_millis(self.boot_key_interval_ms)
    }

    /// Shutdown wait bound as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
