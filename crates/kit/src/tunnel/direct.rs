//! Passthrough tunnel for deployments with direct guest routability.
//!
//! Satisfies the same contract as the SOCKS-backed tunnel so call sites
//! never branch on mode: dials are plain TCP and forwardings simply report
//! the target itself as the service address, since no relay is needed.

use std::net::{SocketAddr, TcpStream};

use color_eyre::eyre::Context as _;
use color_eyre::Result;

use super::relay::BoxedWire;
use super::{split_host_port, ConnWrapper, Forwarding, Tunnel};

/// Tunnel variant used when NAT bridging is skipped.
#[derive(Debug, Default)]
pub struct DirectTunnel;

impl Tunnel for DirectTunnel {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn socks_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn connect_with_addr(&self, address: &str) -> Result<BoxedWire> {
        let (host, port) = split_host_port(address)?;
        let stream = TcpStream::connect((host.as_str(), port))
            .wrap_err_with(|| format!("connecting directly to {address}"))?;
        Ok(Box::new(stream))
    }

    fn create_forwarding(&self, host: String, port: u16) -> Box<dyn Forwarding> {
        Box::new(DirectForwarding { host, port })
    }

    fn create_wrapper_forwarding(
        &self,
        host: String,
        port: u16,
        _wrapper: ConnWrapper,
    ) -> Box<dyn Forwarding> {
        // Without a relay in the path there is nowhere to apply the wrapper;
        // clients reach the target's native protocol directly.
        Box::new(DirectForwarding { host, port })
    }
}

/// "Forwarding" that hands out the target address unchanged.
#[derive(Debug)]
struct DirectForwarding {
    host: String,
    port: u16,
}

impl Forwarding for DirectForwarding {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn service_host(&self) -> String {
        self.host.clone()
    }

    fn service_port(&self) -> u16 {
        self.port
    }
}
