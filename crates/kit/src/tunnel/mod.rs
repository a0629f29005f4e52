//! Reaching the guest-only network behind the hypervisor host.
//!
//! One [`Tunnel`] instance spans the whole build: the real variant keeps an
//! SSH session to the management host and fronts it with a local SOCKS5
//! listener, the direct variant is a passthrough for deployments where the
//! guest network is routable. Both satisfy the identical contract, selected
//! once at construction, so nothing downstream branches on mode.
//!
//! [`Forwarding`]s hand a plain local address to protocol-unaware code (a
//! VNC viewer, a provisioning communicator) and relay every accepted
//! connection to a tunneled target, optionally transforming each freshly
//! dialed backend connection first (the console TLS handshake).

use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;
use tracing::{debug, warn};

mod direct;
pub mod relay;
pub mod socks;
pub mod ssh;

pub use direct::DirectTunnel;
pub use relay::{BoxedWire, Wire};
pub use socks::Dialer;

use relay::POLL_TICK;
use socks::{socks_connect, SocksListener};
use ssh::{SshChannelWire, SshConnection};

use crate::config::RemoteConfig;

/// Transform applied to each freshly dialed backend connection of a
/// wrapper forwarding, before any bytes are relayed.
pub type ConnWrapper = Arc<dyn Fn(BoxedWire) -> Result<BoxedWire> + Send + Sync>;

/// Gateway into the guest-only network.
pub trait Tunnel: Send + Sync {
    /// Bring up the tunnel's listener side. Must be called before any dial.
    fn start(&self) -> Result<()>;

    /// Tear down listeners and the underlying transport. Blocked accepts
    /// and reads error out promptly rather than hanging shutdown.
    fn close(&self);

    /// Address of the local SOCKS5 endpoint, when one exists.
    fn socks_addr(&self) -> Option<SocketAddr>;

    /// Dial `host:port` behind the tunnel.
    fn connect_with_addr(&self, address: &str) -> Result<BoxedWire>;

    /// Dial a host/port pair behind the tunnel.
    fn connect(&self, host: &str, port: u16) -> Result<BoxedWire> {
        self.connect_with_addr(&format!("{host}:{port}"))
    }

    /// A forwarding that relays local connections to `host:port`.
    fn create_forwarding(&self, host: String, port: u16) -> Box<dyn Forwarding>;

    /// Like [`Tunnel::create_forwarding`], with `wrapper` applied to each
    /// newly dialed backend connection.
    fn create_wrapper_forwarding(
        &self,
        host: String,
        port: u16,
        wrapper: ConnWrapper,
    ) -> Box<dyn Forwarding>;
}

/// A local listener relaying accepted connections to a tunneled target.
pub trait Forwarding: Send {
    /// Bind the local listener and start accepting.
    fn start(&mut self) -> Result<()>;

    /// Stop accepting. In-flight relays run to completion.
    fn close(&mut self);

    /// Host clients should connect to. Meaningful once started.
    fn service_host(&self) -> String;

    /// Port clients should connect to. Zero until started.
    fn service_port(&self) -> u16;
}

/// Build the tunnel variant the configuration asks for.
///
/// With NAT bridging skipped the guest network is assumed routable and no
/// SSH session is opened at all; otherwise an authenticated session to the
/// management host backs every dial.
pub fn create_tunnel(skip_nat_mapping: bool, remote: &RemoteConfig) -> Result<Arc<dyn Tunnel>> {
    if skip_nat_mapping {
        debug!("NAT bridging skipped, using direct connections");
        return Ok(Arc::new(DirectTunnel));
    }
    let ssh = SshConnection::connect(remote)?;
    Ok(Arc::new(SocksTunnel::over_ssh(ssh)))
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| eyre!("address '{address}' is missing a port"))?;
    let port: u16 = port
        .parse()
        .wrap_err_with(|| format!("address '{address}' has an invalid port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// The real tunnel: a local SOCKS5 front over a backend dialer.
///
/// In production the backend opens `direct-tcpip` channels on an SSH
/// session; [`SocksTunnel::with_backend`] accepts any dialer so the whole
/// SOCKS/forwarding path can be exercised against in-process backends.
pub struct SocksTunnel {
    backend: Dialer,
    ssh: Option<Arc<SshConnection>>,
    socks: Arc<Mutex<Option<SocksListener>>>,
}

impl fmt::Debug for SocksTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksTunnel")
            .field("ssh", &self.ssh)
            .field("socks_addr", &self.socks_addr())
            .finish_non_exhaustive()
    }
}

impl SocksTunnel {
    /// Tunnel whose dials go through `direct-tcpip` channels on `ssh`.
    pub fn over_ssh(ssh: SshConnection) -> Self {
        let ssh = Arc::new(ssh);
        let channel_ssh = Arc::clone(&ssh);
        let backend: Dialer = Arc::new(move |host: &str, port: u16| {
            channel_ssh
                .open_channel(host, port)
                .map(|channel| Box::new(SshChannelWire::new(channel)) as BoxedWire)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{e:#}")))
        });
        Self {
            backend,
            ssh: Some(ssh),
            socks: Arc::default(),
        }
    }

    /// Tunnel over an arbitrary backend dialer.
    pub fn with_backend(backend: Dialer) -> Self {
        Self {
            backend,
            ssh: None,
            socks: Arc::default(),
        }
    }
}

impl Tunnel for SocksTunnel {
    fn start(&self) -> Result<()> {
        let listener = SocksListener::spawn(Arc::clone(&self.backend))
            .wrap_err("starting local SOCKS listener")?;
        *self.socks.lock().unwrap() = Some(listener);
        Ok(())
    }

    fn close(&self) {
        if let Some(mut listener) = self.socks.lock().unwrap().take() {
            listener.shutdown();
        }
        if let Some(ssh) = &self.ssh {
            ssh.disconnect();
        }
    }

    fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks.lock().unwrap().as_ref().map(|l| l.local_addr())
    }

    fn connect_with_addr(&self, address: &str) -> Result<BoxedWire> {
        // Chain through the local SOCKS listener so in-process dials take
        // the same path an external SOCKS client would.
        let proxy = self
            .socks_addr()
            .ok_or_else(|| eyre!("tunnel has not been started"))?;
        let (host, port) = split_host_port(address)?;
        let stream = socks_connect(proxy, &host, port)
            .wrap_err_with(|| format!("connecting to {address} through the tunnel"))?;
        Ok(Box::new(stream))
    }

    fn create_forwarding(&self, host: String, port: u16) -> Box<dyn Forwarding> {
        Box::new(RelayForwarding::new(
            socks_dialer(Arc::clone(&self.socks)),
            host,
            port,
            None,
        ))
    }

    fn create_wrapper_forwarding(
        &self,
        host: String,
        port: u16,
        wrapper: ConnWrapper,
    ) -> Box<dyn Forwarding> {
        Box::new(RelayForwarding::new(
            socks_dialer(Arc::clone(&self.socks)),
            host,
            port,
            Some(wrapper),
        ))
    }
}

/// Dialer that chains through the tunnel's SOCKS listener, resolving the
/// listener address at dial time so forwardings can be created before the
/// tunnel is started.
fn socks_dialer(socks: Arc<Mutex<Option<SocksListener>>>) -> Dialer {
    Arc::new(move |host: &str, port: u16| {
        let proxy = socks
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.local_addr())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "tunnel is not started")
            })?;
        socks_connect(proxy, host, port).map(|s| Box::new(s) as BoxedWire)
    })
}

/// Local listener relaying each accepted connection to a dialed target.
pub struct RelayForwarding {
    dialer: Dialer,
    target_host: String,
    target_port: u16,
    wrapper: Option<ConnWrapper>,
    listener: Option<ListenerHandle>,
}

struct ListenerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for RelayForwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayForwarding")
            .field("target_host", &self.target_host)
            .field("target_port", &self.target_port)
            .field("wrapped", &self.wrapper.is_some())
            .field("service_port", &self.service_port())
            .finish_non_exhaustive()
    }
}

impl RelayForwarding {
    fn new(
        dialer: Dialer,
        target_host: String,
        target_port: u16,
        wrapper: Option<ConnWrapper>,
    ) -> Self {
        Self {
            dialer,
            target_host,
            target_port,
            wrapper,
            listener: None,
        }
    }

    fn accept_loop(
        listener: TcpListener,
        dialer: Dialer,
        wrapper: Option<ConnWrapper>,
        target: (String, u16),
        stop: Arc<AtomicBool>,
    ) {
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((conn, _)) => {
                    let dialer = Arc::clone(&dialer);
                    let wrapper = wrapper.clone();
                    let target = target.clone();
                    thread::spawn(move || {
                        Self::serve_connection(conn, &dialer, wrapper.as_ref(), &target)
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_TICK);
                }
                Err(e) => {
                    warn!("forwarding accept failed: {e}");
                    thread::sleep(POLL_TICK);
                }
            }
        }
    }

    // One accepted connection end to end. A failure here drops this
    // connection only; the listener keeps accepting.
    fn serve_connection(
        conn: TcpStream,
        dialer: &Dialer,
        wrapper: Option<&ConnWrapper>,
        (host, port): &(String, u16),
    ) {
        let backend = match dialer(host, *port) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("forwarding dial to {host}:{port} failed: {e}");
                return;
            }
        };
        let backend = match wrapper {
            Some(wrap) => match wrap(backend) {
                Ok(wrapped) => wrapped,
                Err(e) => {
                    warn!("wrapping connection to {host}:{port} failed: {e:#}");
                    return;
                }
            },
            None => backend,
        };
        if let Err(e) = relay::relay(Box::new(conn), backend) {
            debug!("forwarded connection to {host}:{port} ended: {e}");
        }
    }
}

impl Forwarding for RelayForwarding {
    fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").wrap_err("binding forwarding listener")?;
        listener
            .set_nonblocking(true)
            .wrap_err("configuring forwarding listener")?;
        let addr = listener.local_addr().wrap_err("resolving listener address")?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::spawn({
            let dialer = Arc::clone(&self.dialer);
            let wrapper = self.wrapper.clone();
            let target = (self.target_host.clone(), self.target_port);
            let stop = Arc::clone(&stop);
            move || Self::accept_loop(listener, dialer, wrapper, target, stop)
        });
        debug!(
            "forwarding {addr} -> {}:{} started",
            self.target_host, self.target_port
        );
        self.listener = Some(ListenerHandle {
            addr,
            stop,
            thread: Some(thread),
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut handle) = self.listener.take() {
            handle.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn service_host(&self) -> String {
        self.listener
            .as_ref()
            .map(|l| l.addr.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    fn service_port(&self) -> u16 {
        self.listener.as_ref().map(|l| l.addr.port()).unwrap_or(0)
    }
}

impl Drop for RelayForwarding {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn direct_backend() -> Dialer {
        Arc::new(|host: &str, port: u16| {
            TcpStream::connect((host, port)).map(|s| Box::new(s) as BoxedWire)
        })
    }

    fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            while let Ok((mut conn, _)) = listener.accept() {
                thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = conn.read(&mut buf) {
                        if n == 0 || conn.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn echo_round_trip(conn: &mut BoxedWire, payload: &[u8]) {
        conn.write_all(payload).unwrap();
        let mut buf = vec![0u8; payload.len()];
        let mut read = 0;
        while read < buf.len() {
            match conn.read(&mut buf[read..]) {
                Ok(0) => panic!("stream closed early"),
                Ok(n) => read += n,
                Err(e) if relay::is_idle(&e) => continue,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(buf, payload);
    }

    // Both variants must pass the identical contract; mode only changes
    // whether traffic actually tunnels.
    fn check_tunnel_contract(tunnel: &dyn Tunnel) {
        let echo = spawn_echo_server();
        tunnel.start().unwrap();

        let mut conn = tunnel.connect(&echo.ip().to_string(), echo.port()).unwrap();
        echo_round_trip(&mut conn, b"via connect");
        drop(conn);

        let mut conn = tunnel
            .connect_with_addr(&format!("{}:{}", echo.ip(), echo.port()))
            .unwrap();
        echo_round_trip(&mut conn, b"via connect_with_addr");
        drop(conn);

        let mut forwarding = tunnel.create_forwarding(echo.ip().to_string(), echo.port());
        forwarding.start().unwrap();
        let service = format!("{}:{}", forwarding.service_host(), forwarding.service_port());
        let mut conn: BoxedWire = Box::new(TcpStream::connect(service).unwrap());
        echo_round_trip(&mut conn, b"via forwarding");
        drop(conn);
        forwarding.close();

        tunnel.close();
    }

    #[test]
    fn socks_tunnel_satisfies_the_contract() {
        check_tunnel_contract(&SocksTunnel::with_backend(direct_backend()));
    }

    #[test]
    fn direct_tunnel_satisfies_the_contract() {
        check_tunnel_contract(&DirectTunnel);
    }

    #[test]
    fn forwarding_relays_connections_independently() {
        let echo = spawn_echo_server();
        let tunnel = SocksTunnel::with_backend(direct_backend());
        tunnel.start().unwrap();

        let mut forwarding = tunnel.create_forwarding(echo.ip().to_string(), echo.port());
        forwarding.start().unwrap();
        let service = format!("{}:{}", forwarding.service_host(), forwarding.service_port());

        let mut first: BoxedWire = Box::new(TcpStream::connect(&service).unwrap());
        let mut second: BoxedWire = Box::new(TcpStream::connect(&service).unwrap());
        echo_round_trip(&mut second, b"second connection");
        echo_round_trip(&mut first, b"first connection");

        // Closing the listener must not cross-wire relays already up.
        forwarding.close();
        echo_round_trip(&mut first, b"after close");

        tunnel.close();
    }

    #[test]
    fn wrapper_runs_on_each_backend_connection() {
        let echo = spawn_echo_server();
        let tunnel = SocksTunnel::with_backend(direct_backend());
        tunnel.start().unwrap();

        // Prefix each backend connection with a banner the echo server will
        // reflect, proving the wrapper saw the connection before the relay.
        let wrapper: ConnWrapper = Arc::new(|mut conn: BoxedWire| {
            conn.write_all(b"BANNER:")?;
            Ok(conn)
        });
        let mut forwarding =
            tunnel.create_wrapper_forwarding(echo.ip().to_string(), echo.port(), wrapper);
        forwarding.start().unwrap();

        let mut conn = TcpStream::connect(format!(
            "{}:{}",
            forwarding.service_host(),
            forwarding.service_port()
        ))
        .unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        conn.write_all(b"payload").unwrap();
        let mut buf = [0u8; 14];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"BANNER:payload");

        forwarding.close();
        tunnel.close();
    }

    #[test]
    fn unstarted_tunnel_refuses_to_dial() {
        let tunnel = SocksTunnel::with_backend(direct_backend());
        let err = tunnel.connect("10.0.0.1", 22).err().unwrap();
        assert!(err.to_string().contains("not been started"));
    }

    #[test]
    fn split_host_port_handles_names_and_brackets() {
        assert_eq!(
            split_host_port("console.local:443").unwrap(),
            ("console.local".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[::1]:5900").unwrap(),
            ("::1".to_string(), 5900)
        );
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("host:notaport").is_err());
    }
}
