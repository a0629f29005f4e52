//! Minimal RFB 3.8 client, just enough to drive a keyboard.
//!
//! The console multiplexer hands us a raw RFB stream after the HTTP
//! upgrade; all the build needs from it is the handshake and KeyEvent
//! messages for typing the boot command. Framebuffer contents are never
//! requested or read.

use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use color_eyre::eyre::{bail, Context as _};
use color_eyre::Result;
use tracing::debug;

use crate::tunnel::relay::is_idle;
use crate::tunnel::BoxedWire;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";
const SECURITY_NONE: u8 = 1;
const MSG_KEY_EVENT: u8 = 4;

/// X11 keysym for the left Shift modifier.
pub const KEYSYM_SHIFT: u32 = 0xffe1;

/// An RFB session ready to inject key events.
pub struct RfbClient {
    stream: BoxedWire,
    desktop_name: String,
}

impl fmt::Debug for RfbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RfbClient")
            .field("desktop_name", &self.desktop_name)
            .finish_non_exhaustive()
    }
}

impl RfbClient {
    /// Negotiate version 3.8 with security type None and a shared session.
    pub fn handshake(mut stream: BoxedWire) -> Result<Self> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

        let mut version = [0u8; 12];
        read_exact_by(&mut stream, &mut version, deadline)
            .wrap_err("reading RFB protocol version")?;
        if &version[..4] != b"RFB " {
            bail!("console stream did not greet with an RFB protocol version");
        }
        write_all_by(&mut stream, PROTOCOL_VERSION, deadline)
            .wrap_err("sending RFB protocol version")?;

        let mut count = [0u8; 1];
        read_exact_by(&mut stream, &mut count, deadline)
            .wrap_err("reading RFB security type count")?;
        if count[0] == 0 {
            let mut len = [0u8; 4];
            read_exact_by(&mut stream, &mut len, deadline)?;
            let mut reason = vec![0u8; u32::from_be_bytes(len) as usize];
            read_exact_by(&mut stream, &mut reason, deadline)?;
            bail!(
                "console refused the RFB handshake: {}",
                String::from_utf8_lossy(&reason)
            );
        }
        let mut types = vec![0u8; count[0] as usize];
        read_exact_by(&mut stream, &mut types, deadline)
            .wrap_err("reading RFB security types")?;
        if !types.contains(&SECURITY_NONE) {
            bail!("console offers no open RFB security type (offered {types:?})");
        }
        write_all_by(&mut stream, &[SECURITY_NONE], deadline)?;

        let mut result = [0u8; 4];
        read_exact_by(&mut stream, &mut result, deadline)
            .wrap_err("reading RFB security result")?;
        if u32::from_be_bytes(result) != 0 {
            bail!("console rejected the RFB security handshake");
        }

        // ClientInit, shared session: the console stays usable elsewhere.
        write_all_by(&mut stream, &[1], deadline)?;

        // ServerInit: geometry and pixel format are irrelevant for typing.
        let mut server_init = [0u8; 2 + 2 + 16 + 4];
        read_exact_by(&mut stream, &mut server_init, deadline)
            .wrap_err("reading RFB server init")?;
        let name_len = u32::from_be_bytes([
            server_init[20],
            server_init[21],
            server_init[22],
            server_init[23],
        ]);
        let mut name = vec![0u8; name_len as usize];
        read_exact_by(&mut stream, &mut name, deadline).wrap_err("reading RFB desktop name")?;
        let desktop_name = String::from_utf8_lossy(&name).into_owned();
        debug!("RFB session established to desktop '{desktop_name}'");

        Ok(Self {
            stream,
            desktop_name,
        })
    }

    /// Name the server reported in ServerInit.
    pub fn desktop_name(&self) -> &str {
        &self.desktop_name
    }

    /// Send a single KeyEvent.
    pub fn key_event(&mut self, keysym: u32, down: bool) -> Result<()> {
        let mut msg = [0u8; 8];
        msg[0] = MSG_KEY_EVENT;
        msg[1] = down as u8;
        msg[4..8].copy_from_slice(&keysym.to_be_bytes());
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        write_all_by(&mut self.stream, &msg, deadline).wrap_err("sending RFB key event")?;
        self.stream.flush().or_else(|e| if is_idle(&e) { Ok(()) } else { Err(e) })?;
        Ok(())
    }

    /// Press and release a key.
    pub fn press_key(&mut self, keysym: u32) -> Result<()> {
        self.key_event(keysym, true)?;
        self.key_event(keysym, false)
    }
}

fn read_exact_by(stream: &mut BoxedWire, buf: &mut [u8], deadline: Instant) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => bail!("console closed the RFB stream"),
            Ok(n) => filled += n,
            Err(e) if is_idle(&e) => {
                if Instant::now() >= deadline {
                    bail!("RFB handshake did not complete within {HANDSHAKE_TIMEOUT:?}");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_all_by(stream: &mut BoxedWire, mut buf: &[u8], deadline: Instant) -> Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => bail!("console stopped accepting RFB bytes"),
            Ok(n) => buf = &buf[n..],
            Err(e) if is_idle(&e) => {
                if Instant::now() >= deadline {
                    bail!("RFB handshake did not complete within {HANDSHAKE_TIMEOUT:?}");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    /// Speaks just enough of the server side of RFB 3.8 to accept one
    /// client, then records every key event it receives.
    fn spawn_rfb_server(desktop: &'static str) -> (std::net::SocketAddr, thread::JoinHandle<Vec<(u32, bool)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"RFB 003.008\n").unwrap();
            let mut version = [0u8; 12];
            conn.read_exact(&mut version).unwrap();
            assert_eq!(&version, b"RFB 003.008\n");

            conn.write_all(&[1, SECURITY_NONE]).unwrap();
            let mut choice = [0u8; 1];
            conn.read_exact(&mut choice).unwrap();
            assert_eq!(choice[0], SECURITY_NONE);
            conn.write_all(&0u32.to_be_bytes()).unwrap();

            let mut shared = [0u8; 1];
            conn.read_exact(&mut shared).unwrap();
            assert_eq!(shared[0], 1);

            let mut server_init = Vec::new();
            server_init.extend_from_slice(&720u16.to_be_bytes());
            server_init.extend_from_slice(&400u16.to_be_bytes());
            server_init.extend_from_slice(&[0u8; 16]);
            server_init.extend_from_slice(&(desktop.len() as u32).to_be_bytes());
            server_init.extend_from_slice(desktop.as_bytes());
            conn.write_all(&server_init).unwrap();

            let mut events = Vec::new();
            let mut msg = [0u8; 8];
            while conn.read_exact(&mut msg).is_ok() {
                assert_eq!(msg[0], MSG_KEY_EVENT);
                let keysym = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]);
                events.push((keysym, msg[1] == 1));
            }
            events
        });
        (addr, handle)
    }

    #[test]
    fn handshake_and_key_events_round_trip() {
        let (addr, server) = spawn_rfb_server("guest console");
        let stream: BoxedWire = Box::new(TcpStream::connect(addr).unwrap());

        let mut client = RfbClient::handshake(stream).unwrap();
        assert_eq!(client.desktop_name(), "guest console");

        client.press_key(0x62).unwrap(); // 'b'
        client.key_event(KEYSYM_SHIFT, true).unwrap();
        client.press_key(0x41).unwrap(); // 'A'
        client.key_event(KEYSYM_SHIFT, false).unwrap();
        drop(client);

        let events = server.join().unwrap();
        assert_eq!(
            events,
            vec![
                (0x62, true),
                (0x62, false),
                (KEYSYM_SHIFT, true),
                (0x41, true),
                (0x41, false),
                (KEYSYM_SHIFT, false),
            ]
        );
    }

    #[test]
    fn refusal_reason_is_surfaced() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"RFB 003.008\n").unwrap();
            let mut version = [0u8; 12];
            conn.read_exact(&mut version).unwrap();
            conn.write_all(&[0]).unwrap();
            conn.write_all(&13u32.to_be_bytes()).unwrap();
            conn.write_all(b"access denied").unwrap();
        });

        let stream: BoxedWire = Box::new(TcpStream::connect(addr).unwrap());
        let err = RfbClient::handshake(stream).unwrap_err();
        assert!(err.to_string().contains("refused the RFB handshake"));
    }
}
