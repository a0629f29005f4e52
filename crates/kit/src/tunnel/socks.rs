//! Minimal SOCKS5 (RFC 1928) server and client handshake.
//!
//! The server supports exactly what the tunnel needs: no authentication and
//! the CONNECT command, with the backend dial delegated to a caller-supplied
//! callback so the same listener serves SSH-tunneled and direct dials alike.
//! The client half performs the matching handshake so in-process connections
//! take the identical path an external SOCKS client would.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::relay::{relay, BoxedWire, POLL_TICK};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// How long a client may take to complete the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a backend connection for a CONNECT request.
pub type Dialer = Arc<dyn Fn(&str, u16) -> io::Result<BoxedWire> + Send + Sync>;

/// A loopback SOCKS5 listener whose backend dials go through a [`Dialer`].
///
/// The accept loop runs on its own thread and each accepted connection is
/// relayed on its own thread, so in-flight relays survive listener shutdown.
#[derive(Debug)]
pub struct SocksListener {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl SocksListener {
    /// Bind `127.0.0.1:0` and start serving.
    pub fn spawn(dialer: Dialer) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let accept_thread = thread::spawn(move || accept_loop(listener, dialer, stop_flag));
        debug!(%addr, "socks listener started");
        Ok(Self {
            addr,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    /// The loopback address clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting. Established relays keep running to completion.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SocksListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, dialer: Dialer, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((conn, peer)) => {
                let dialer = Arc::clone(&dialer);
                thread::spawn(move || {
                    if let Err(e) = serve_client(conn, &dialer) {
                        debug!(%peer, "socks connection ended: {e}");
                    }
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_TICK);
            }
            Err(e) => {
                warn!("socks accept failed: {e}");
                thread::sleep(POLL_TICK);
            }
        }
    }
}

fn read_u8(conn: &mut TcpStream) -> io::Result<u8> {
    let mut b = [0u8; 1];
    conn.read_exact(&mut b)?;
    Ok(b[0])
}

/// Parse the request's DST.ADDR/DST.PORT into a dialable host string.
fn read_target(conn: &mut TcpStream, atyp: u8) -> io::Result<(String, u16)> {
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            conn.read_exact(&mut octets)?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = read_u8(conn)? as usize;
            let mut name = vec![0u8; len];
            conn.read_exact(&mut name)?;
            String::from_utf8(name).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "domain name is not UTF-8")
            })?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            conn.read_exact(&mut octets)?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address type {other:#04x}"),
            ))
        }
    };
    let mut port = [0u8; 2];
    conn.read_exact(&mut port)?;
    Ok((host, u16::from_be_bytes(port)))
}

fn write_reply(conn: &mut TcpStream, rep: u8) -> io::Result<()> {
    // BND.ADDR/BND.PORT carry no information for CONNECT relays.
    conn.write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
}

fn serve_client(mut conn: TcpStream, dialer: &Dialer) -> io::Result<()> {
    conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    // Method negotiation.
    let version = read_u8(&mut conn)?;
    if version != SOCKS_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version {version}"),
        ));
    }
    let nmethods = read_u8(&mut conn)? as usize;
    let mut methods = vec![0u8; nmethods];
    conn.read_exact(&mut methods)?;
    if !methods.contains(&METHOD_NO_AUTH) {
        conn.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "client offered no acceptable authentication method",
        ));
    }
    conn.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])?;

    // Request.
    let mut head = [0u8; 4];
    conn.read_exact(&mut head)?;
    let [_, cmd, _, atyp] = head;
    if cmd != CMD_CONNECT {
        write_reply(&mut conn, REP_COMMAND_NOT_SUPPORTED)?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported SOCKS command {cmd:#04x}"),
        ));
    }
    let (host, port) = read_target(&mut conn, atyp)?;

    let backend = match dialer(&host, port) {
        Ok(backend) => backend,
        Err(e) => {
            write_reply(&mut conn, REP_HOST_UNREACHABLE)?;
            return Err(io::Error::new(
                e.kind(),
                format!("dialing {host}:{port}: {e}"),
            ));
        }
    };
    write_reply(&mut conn, REP_SUCCESS)?;
    debug!("socks relay established to {host}:{port}");
    relay(Box::new(conn), backend)
}

/// Client half: connect to `proxy` and ask it to CONNECT to `host:port`.
pub fn socks_connect(proxy: SocketAddr, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut conn = TcpStream::connect(proxy)?;
    conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    conn.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])?;
    let mut choice = [0u8; 2];
    conn.read_exact(&mut choice)?;
    if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "proxy rejected no-auth method negotiation",
        ));
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        request.push(ATYP_IPV4);
        request.extend_from_slice(&v4.octets());
    } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
        request.push(ATYP_IPV6);
        request.extend_from_slice(&v6.octets());
    } else {
        if host.len() > 255 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "host name longer than 255 bytes",
            ));
        }
        request.push(ATYP_DOMAIN);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&request)?;

    let mut head = [0u8; 4];
    conn.read_exact(&mut head)?;
    let [version, rep, _, atyp] = head;
    if version != SOCKS_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected reply version {version}"),
        ));
    }
    if rep != REP_SUCCESS {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused CONNECT to {host}:{port} (reply code {rep:#04x})"),
        ));
    }
    // Drain BND.ADDR/BND.PORT.
    let bound_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_DOMAIN => read_u8(&mut conn)? as usize,
        ATYP_IPV6 => 16,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported bound address type {other:#04x}"),
            ))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    conn.read_exact(&mut bound)?;

    conn.set_read_timeout(None)?;
    conn.set_write_timeout(None)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn direct_dialer() -> Dialer {
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

    #[test]
    fn connect_relays_echo_traffic() {
        let echo = spawn_echo_server();
        let mut listener = SocksListener::spawn(direct_dialer()).unwrap();

        let mut conn =
            socks_connect(listener.local_addr(), &echo.ip().to_string(), echo.port()).unwrap();
        conn.write_all(b"hello through socks").unwrap();
        let mut buf = [0u8; 19];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello through socks");

        listener.shutdown();
    }

    #[test]
    fn domain_targets_reach_the_dialer() {
        let echo = spawn_echo_server();
        let mut listener = SocksListener::spawn(Arc::new(move |host: &str, port: u16| {
            assert_eq!(host, "guest.internal");
            assert_eq!(port, 7111);
            TcpStream::connect(echo).map(|s| Box::new(s) as BoxedWire)
        }))
        .unwrap();

        let mut conn = socks_connect(listener.local_addr(), "guest.internal", 7111).unwrap();
        conn.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");

        listener.shutdown();
    }

    #[test]
    fn dial_failure_surfaces_as_refused_connect() {
        let mut listener = SocksListener::spawn(Arc::new(|host: &str, port: u16| {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no route to {host}:{port}"),
            ))
        }))
        .unwrap();

        let err = socks_connect(listener.local_addr(), "10.0.0.9", 22).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        listener.shutdown();
    }

    #[test]
    fn in_flight_relay_survives_listener_shutdown() {
        let echo = spawn_echo_server();
        let mut listener = SocksListener::spawn(direct_dialer()).unwrap();

        let mut conn =
            socks_connect(listener.local_addr(), &echo.ip().to_string(), echo.port()).unwrap();
        listener.shutdown();

        conn.write_all(b"still here").unwrap();
        let mut buf = [0u8; 10];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still here");
    }
}
