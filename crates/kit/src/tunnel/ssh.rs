//! SSH session to the hypervisor management host.
//!
//! One authenticated session backs every tunneled dial: guest-network
//! connections are opened as `direct-tcpip` channels on it. Host key
//! verification is deliberately skipped: the management host is a private
//! endpoint with self-issued credentials, and trust is anchored by network
//! reachability plus the authenticated session, not PKI.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use color_eyre::eyre::{bail, eyre, Context as _};
use color_eyre::Result;
use ssh2::{Channel, Session};
use tracing::debug;

use super::relay::{is_idle, Wire};
use crate::config::RemoteConfig;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Session timeout while a channel open or exec is in flight.
const SETUP_TIMEOUT_MS: u32 = 15_000;

/// Steady-state session timeout. Keeps channel reads bounded so the relay
/// can service both directions from one thread.
const IO_TICK_MS: u32 = 100;

const EXEC_DEADLINE: Duration = Duration::from_secs(30);

/// An authenticated SSH session to the management host.
///
/// The mutex serializes channel opens and exec calls; established channels
/// do their I/O through libssh2's own session locking.
pub struct SshConnection {
    session: Mutex<Session>,
    host: String,
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    /// Connect and authenticate against the configured management host.
    pub fn connect(remote: &RemoteConfig) -> Result<Self> {
        let endpoint = format!("{}:{}", remote.host, remote.ssh_port);
        let addr: SocketAddr = (remote.host.as_str(), remote.ssh_port)
            .to_socket_addrs()
            .wrap_err_with(|| format!("resolving SSH endpoint {endpoint}"))?
            .next()
            .ok_or_else(|| eyre!("SSH endpoint {endpoint} resolved to no addresses"))?;
        let tcp = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT)
            .wrap_err_with(|| format!("connecting to SSH endpoint {endpoint}"))?;

        let mut session = Session::new().wrap_err("creating SSH session")?;
        session.set_tcp_stream(tcp);
        // No known-hosts check here, see the module docs.
        session
            .handshake()
            .wrap_err_with(|| format!("SSH handshake with {endpoint}"))?;

        if let Some(password) = &remote.password {
            session
                .userauth_password(&remote.username, password)
                .wrap_err_with(|| format!("password authentication for {}", remote.username))?;
        } else if let Some(key) = &remote.private_key_path {
            session
                .userauth_pubkey_file(&remote.username, None, key.as_std_path(), None)
                .wrap_err_with(|| format!("key authentication for {} with {key}", remote.username))?;
        } else {
            bail!("no SSH credentials configured for {endpoint}");
        }
        if !session.authenticated() {
            bail!("SSH authentication was not accepted by {endpoint}");
        }

        session.set_timeout(IO_TICK_MS);
        debug!(%endpoint, user = %remote.username, "SSH session established");
        Ok(Self {
            session: Mutex::new(session),
            host: remote.host.clone(),
        })
    }

    /// Open a `direct-tcpip` channel to `host:port` on the guest network.
    pub fn open_channel(&self, host: &str, port: u16) -> Result<Channel> {
        let session = self.session.lock().unwrap();
        session.set_timeout(SETUP_TIMEOUT_MS);
        let channel = session.channel_direct_tcpip(host, port, None);
        session.set_timeout(IO_TICK_MS);
        channel.wrap_err_with(|| {
            format!("opening tunneled connection to {host}:{port} via {}", self.host)
        })
    }

    /// Run `command` on the management host and capture its stdout.
    pub fn exec_capture(&self, command: &str) -> Result<String> {
        let session = self.session.lock().unwrap();
        session.set_timeout(SETUP_TIMEOUT_MS);
        let result = exec_on(&session, command);
        session.set_timeout(IO_TICK_MS);
        result.wrap_err_with(|| format!("running '{command}' on {}", self.host))
    }

    /// Tear the session down. Blocked channel reads error out promptly.
    pub fn disconnect(&self) {
        let session = self.session.lock().unwrap();
        if let Err(e) = session.disconnect(None, "closing", None) {
            debug!("SSH disconnect: {e}");
        }
    }
}

fn exec_on(session: &Session, command: &str) -> Result<String> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let deadline = Instant::now() + EXEC_DEADLINE;
    let mut output = String::new();
    let mut buf = [0u8; 4096];
    loop {
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) if is_idle(&e) => {
                if Instant::now() >= deadline {
                    bail!("command produced no output within {EXEC_DEADLINE:?}");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    let _ = channel.wait_close();
    Ok(output)
}

/// Connect, run one command on the management host, and disconnect.
///
/// Used by steps that need a host-side answer (such as the management
/// network's view of the automation host) without holding a session open.
pub fn exec_host_command(remote: &RemoteConfig, command: &str) -> Result<String> {
    let connection = SshConnection::connect(remote)?;
    let output = connection.exec_capture(command);
    connection.disconnect();
    output
}

/// A `direct-tcpip` channel adapted to the relay's [`Wire`] contract.
pub(crate) struct SshChannelWire {
    channel: Channel,
}

impl SshChannelWire {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl Read for SshChannelWire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }
}

impl Write for SshChannelWire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }
}

impl Wire for SshChannelWire {
    fn set_io_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        // Reads are already bounded by the session-level tick.
        Ok(())
    }

    fn close_write(&mut self) -> io::Result<()> {
        self.channel
            .send_eof()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}
