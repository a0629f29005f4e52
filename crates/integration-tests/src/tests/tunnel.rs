//! Tunnel and forwarding behavior over real loopback sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{ensure, Context};
use color_eyre::Result;
use integration_tests::integration_test;
use linkme::distributed_slice;

use xvk::tunnel::{BoxedWire, ConnWrapper, SocksTunnel, Tunnel};

use crate::{direct_backend, spawn_echo_server};

fn echo_round_trip(conn: &mut TcpStream, payload: &[u8]) -> Result<()> {
    conn.set_read_timeout(Some(Duration::from_secs(5)))?;
    conn.write_all(payload)?;
    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).context("reading echo reply")?;
    ensure!(buf == payload, "echo reply does not match");
    Ok(())
}

fn test_forwarding_round_trip() -> Result<()> {
    let echo = spawn_echo_server();
    let tunnel = SocksTunnel::with_backend(direct_backend());
    tunnel.start()?;

    let mut forwarding = tunnel.create_forwarding(echo.ip().to_string(), echo.port());
    forwarding.start()?;
    ensure!(forwarding.service_port() != 0, "forwarding has no port");

    let service = format!("{}:{}", forwarding.service_host(), forwarding.service_port());
    let mut conn = TcpStream::connect(&service)?;
    echo_round_trip(&mut conn, b"through the forwarding")?;

    // A second connection gets its own backend dial.
    let mut other = TcpStream::connect(&service)?;
    echo_round_trip(&mut other, b"independent connection")?;

    forwarding.close();
    tunnel.close();
    Ok(())
}
integration_test!(test_forwarding_round_trip);

fn test_wrapper_transforms_backend_connections() -> Result<()> {
    let echo = spawn_echo_server();
    let tunnel = SocksTunnel::with_backend(direct_backend());
    tunnel.start()?;

    // The wrapper writes a banner the echo server reflects back, so the
    // client sees it before its own payload.
    let wrapper: ConnWrapper = Arc::new(|mut conn: BoxedWire| {
        conn.write_all(b"HELLO:")?;
        Ok(conn)
    });
    let mut forwarding =
        tunnel.create_wrapper_forwarding(echo.ip().to_string(), echo.port(), wrapper);
    forwarding.start()?;

    let mut conn = TcpStream::connect(format!(
        "{}:{}",
        forwarding.service_host(),
        forwarding.service_port()
    ))?;
    conn.set_read_timeout(Some(Duration::from_secs(5)))?;
    conn.write_all(b"payload")?;
    let mut buf = [0u8; 13];
    conn.read_exact(&mut buf)?;
    ensure!(&buf == b"HELLO:payload", "banner missing: {buf:?}");

    forwarding.close();
    tunnel.close();
    Ok(())
}
integration_test!(test_wrapper_transforms_backend_connections);

fn test_closed_tunnel_stops_accepting() -> Result<()> {
    let tunnel = SocksTunnel::with_backend(direct_backend());
    tunnel.start()?;
    let addr = tunnel.socks_addr().expect("socks address");
    tunnel.close();

    // The listener is gone; a fresh connection must fail or be dropped
    // without ever completing a SOCKS handshake.
    match TcpStream::connect(addr) {
        Err(_) => {}
        Ok(mut conn) => {
            conn.set_read_timeout(Some(Duration::from_secs(5)))?;
            conn.write_all(&[0x05, 0x01, 0x00])?;
            let mut buf = [0u8; 2];
            ensure!(
                conn.read_exact(&mut buf).is_err(),
                "closed tunnel still answered a handshake"
            );
        }
    }
    Ok(())
}
integration_test!(test_closed_tunnel_stops_accepting);
