//! Learning the installed guest's IP address.
//!
//! Neither information source is assumed available: in-guest tooling may
//! never start, and an install may never touch the HTTP media server. The
//! discovery loop polls both at a bounded interval and takes whichever
//! produces an address first, subject to the configured policy.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use crate::controlplane::{ControlPlane, VmRef};
use crate::wait::{CancelToken, WaitOutcome, Waiter};

/// Which information source may resolve the guest address.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IpSource {
    /// Race both sources; first answer wins.
    #[default]
    Auto,
    /// Only poll guest-tools network metadata.
    Tools,
    /// Only accept passive HTTP hits from the install.
    Http,
}

impl IpSource {
    fn allows_http(self) -> bool {
        matches!(self, IpSource::Auto | IpSource::Http)
    }

    fn allows_tools(self) -> bool {
        matches!(self, IpSource::Auto | IpSource::Tools)
    }
}

/// Pick the best address out of a guest-metrics networks map: the primary
/// interface's `0/ip` entry first, then any IPv4 entry, then IPv6.
fn first_address(networks: &HashMap<String, String>) -> Option<String> {
    let non_empty = |key: &str| {
        networks
            .get(key)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    };
    if let Some(ip) = non_empty("0/ip") {
        return Some(ip);
    }
    for family in ["ipv4", "ipv6"] {
        let mut keys: Vec<&String> = networks
            .keys()
            .filter(|k| k.contains(family))
            .collect();
        keys.sort();
        if let Some(ip) = keys.into_iter().find_map(|k| non_empty(k)) {
            return Some(ip);
        }
    }
    None
}

/// Wait until one of the allowed sources reports the guest's address.
///
/// Each poll tick drains the HTTP hit channel first (non-blocking), then
/// queries guest metrics, so a passive hit is always preferred within a
/// tick. The first non-empty address wins and is returned as-is; hitting
/// the overall timeout is an error naming the configured bound.
pub fn wait_for_ip(
    client: &dyn ControlPlane,
    vm: &VmRef,
    source: IpSource,
    http_hits: Option<&Receiver<String>>,
    waiter: Waiter,
    cancel: &CancelToken,
) -> Result<String> {
    let mut address: Option<String> = None;
    let outcome = waiter.wait_until(cancel, || {
        if source.allows_http() {
            if let Some(hits) = http_hits {
                while let Ok(hit) = hits.try_recv() {
                    if !hit.is_empty() {
                        debug!("guest address {hit} learned from an HTTP request");
                        address = Some(hit);
                        return Ok(true);
                    }
                }
            }
        }
        if source.allows_tools() {
            if let Some(networks) = client.guest_metrics_networks(vm)? {
                if let Some(ip) = first_address(&networks) {
                    debug!("guest address {ip} reported by guest tools");
                    address = Some(ip);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    })?;

    match outcome {
        WaitOutcome::Done => {
            address.ok_or_else(|| eyre!("IP discovery finished without an address"))
        }
        WaitOutcome::TimedOut => bail!(
            "the guest did not report an IP address within {:?} (ip_wait_timeout); \
             check guest tools or the http ip source",
            waiter.timeout
        ),
        WaitOutcome::Cancelled => bail!("IP discovery was cancelled"),
    }
}
