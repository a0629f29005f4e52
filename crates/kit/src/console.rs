//! Bridge to the hypervisor's console multiplexer.
//!
//! The console endpoint lives on the management network and speaks HTTPS:
//! after a `CONNECT` upgrade carrying the control-plane session cookie, the
//! stream switches to raw RFB bytes. Certificate verification is
//! deliberately disabled: the endpoint presents self-issued credentials
//! and trust comes from the session cookie, not PKI.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::{bail, eyre, Context as _};
use color_eyre::Result;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::debug;
use url::Url;

use crate::controlplane::{unique_vm_by_name, ControlPlane};
use crate::tunnel::relay::is_idle;
use crate::tunnel::{BoxedWire, ConnWrapper, Tunnel, Wire};

/// Overall bound on the TLS + CONNECT handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const IO_TICK: Duration = Duration::from_millis(100);

/// Resolve the console location URL for the named VM.
///
/// The name must resolve to exactly one VM with exactly one console;
/// anything else is a configuration problem worth a precise diagnostic.
pub fn console_location(client: &dyn ControlPlane, vm_name: &str) -> Result<String> {
    let vm = unique_vm_by_name(client, vm_name)?;
    let consoles = client.vm_consoles(&vm)?;
    if consoles.len() != 1 {
        bail!(
            "expected the VM to expose a single console, found {}",
            consoles.len()
        );
    }
    Ok(client.console_location(&consoles[0])?)
}

/// Extract the `host:port` to dial from a console location URL.
///
/// An explicit port wins; otherwise the scheme picks 80 or 443. Any other
/// scheme is a validation error.
pub fn tcp_address_from_url(location: &str) -> Result<String> {
    let url = Url::parse(location).wrap_err_with(|| format!("parsing console URL '{location}'"))?;
    let host = url
        .host_str()
        .ok_or_else(|| eyre!("console URL '{location}' has no host"))?;
    let port = match (url.port(), url.scheme()) {
        (Some(port), _) => port,
        (None, "http") => 80,
        (None, "https") => 443,
        (None, scheme) => bail!("unsupported scheme '{scheme}' in console URL '{location}'"),
    };
    Ok(format!("{host}:{port}"))
}

/// Dial the console through the tunnel and complete the upgrade handshake.
pub fn connect_console(
    tunnel: &dyn Tunnel,
    location: &str,
    session_id: &str,
) -> Result<BoxedWire> {
    let target = tcp_address_from_url(location)?;
    let raw = tunnel
        .connect_with_addr(&target)
        .wrap_err_with(|| format!("dialing console endpoint {target}"))?;
    initialize_console_stream(location, session_id, raw)
}

/// The console handshake as a connection wrapper, so a forwarding can
/// expose the console as a plain local VNC endpoint.
pub fn console_wrapper(location: String, session_id: String) -> ConnWrapper {
    Arc::new(move |raw: BoxedWire| initialize_console_stream(&location, &session_id, raw))
}

/// Wrap `raw` in TLS, send the CONNECT upgrade, and consume the response
/// header. Everything after the header belongs to the RFB client.
pub fn initialize_console_stream(
    location: &str,
    session_id: &str,
    raw: BoxedWire,
) -> Result<BoxedWire> {
    let url = Url::parse(location).wrap_err_with(|| format!("parsing console URL '{location}'"))?;
    let host = url
        .host_str()
        .ok_or_else(|| eyre!("console URL '{location}' has no host"))?
        .to_string();
    let path = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };

    let mut tls = TlsWire::handshake_client(raw, &host)?;
    tls.set_io_timeout(Some(IO_TICK))
        .wrap_err("configuring console stream timeouts")?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let request =
        format!("CONNECT {path} HTTP/1.0\r\nHost: {host}\r\nCookie: session_id={session_id}\r\n\r\n");
    write_all_by(&mut tls, request.as_bytes(), deadline)
        .wrap_err("sending console CONNECT request")?;
    tls.flush().or_else(ignore_idle).wrap_err("flushing console CONNECT request")?;

    let header = read_http_header(&mut tls, deadline)?;
    debug!("console endpoint answered: {}", header.trim_end());
    Ok(Box::new(tls))
}

fn ignore_idle(err: io::Error) -> io::Result<()> {
    if is_idle(&err) {
        Ok(())
    } else {
        Err(err)
    }
}

fn write_all_by(stream: &mut dyn Wire, mut buf: &[u8], deadline: Instant) -> Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => bail!("console endpoint stopped accepting bytes"),
            Ok(n) => buf = &buf[n..],
            Err(e) if is_idle(&e) => {
                if Instant::now() >= deadline {
                    bail!("console handshake did not complete within {HANDSHAKE_TIMEOUT:?}");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read byte-by-byte until the exact end of the `\r\n\r\n` header
/// terminator. No content-length is assumed; the next byte on the stream
/// after this returns is the first RFB byte.
fn read_http_header(stream: &mut dyn Read, deadline: Instant) -> Result<String> {
    let mut header: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => bail!("console endpoint closed the connection during the HTTP handshake"),
            Ok(_) => {
                header.push(byte[0]);
                if header.ends_with(b"\r\n\r\n") {
                    return Ok(String::from_utf8_lossy(&header).into_owned());
                }
            }
            Err(e) if is_idle(&e) => {
                if Instant::now() >= deadline {
                    bail!("console handshake did not complete within {HANDSHAKE_TIMEOUT:?}");
                }
            }
            Err(e) => return Err(e).wrap_err("reading console HTTP response"),
        }
    }
}

/// TLS client stream over any tunneled connection.
struct TlsWire {
    stream: StreamOwned<ClientConnection, BoxedWire>,
}

impl fmt::Debug for TlsWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsWire").finish_non_exhaustive()
    }
}

impl TlsWire {
    fn handshake_client(sock: BoxedWire, host: &str) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| eyre!("'{host}' is not a valid TLS server name"))?;
        let conn = ClientConnection::new(tls_client_config(), server_name)
            .wrap_err("creating TLS client session")?;
        Ok(Self {
            stream: StreamOwned::new(conn, sock),
        })
    }
}

impl Read for TlsWire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TlsWire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Wire for TlsWire {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_io_timeout(timeout)
    }

    fn close_write(&mut self) -> io::Result<()> {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        self.stream.sock.close_write()
    }
}

fn tls_client_config() -> Arc<ClientConfig> {
    use rustls::crypto::{ring, CryptoProvider};

    let _ = CryptoProvider::install_default(ring::default_provider());
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyServerCert))
        .with_no_client_auth();
    Arc::new(config)
}

mod danger {
    //! The console endpoint presents self-issued certificates; see the
    //! module docs for why verification is skipped rather than hardened.

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct AcceptAnyServerCert;

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ]
        }
    }
}
