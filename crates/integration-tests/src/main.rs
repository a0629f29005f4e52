//! Integration tests for xvk
//!
//! Everything here runs against real sockets on the loopback interface,
//! with in-process stand-ins for the hypervisor side (echo servers, a
//! scripted control plane). No hypervisor host is required.

use libtest_mimic::{Arguments, Trial};

pub(crate) use integration_tests::{IntegrationTest, INTEGRATION_TESTS};

mod tests {
    pub mod cli;
    pub mod pipeline;
    pub mod socks;
    pub mod tunnel;
}

/// Path to the xvk binary: XVK_PATH if set, else a workspace target dir.
///
/// `None` means the binary has not been built; CLI tests skip in that case
/// rather than failing on an unrelated precondition.
pub(crate) fn xvk_binary() -> Option<String> {
    if let Ok(path) = std::env::var("XVK_PATH") {
        return Some(path);
    }
    [
        "target/debug/xvk",
        "target/release/xvk",
        "../../target/debug/xvk",
        "../../target/release/xvk",
    ]
    .into_iter()
    .find(|p| std::path::Path::new(p).exists())
    .map(str::to_owned)
}

/// Backend dialer that opens plain TCP connections, standing in for the
/// SSH channel opener.
pub(crate) fn direct_backend() -> xvk::tunnel::Dialer {
    use std::net::TcpStream;
    use std::sync::Arc;
    Arc::new(|host: &str, port: u16| {
        TcpStream::connect((host, port)).map(|s| Box::new(s) as xvk::tunnel::BoxedWire)
    })
}

/// TCP echo server on an ephemeral loopback port, serving until dropped
/// by process exit.
pub(crate) fn spawn_echo_server() -> std::net::SocketAddr {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").expect("binding echo server");
    let addr = listener.local_addr().expect("echo server address");
    std::thread::spawn(move || {
        while let Ok((mut conn, _)) = listener.accept() {
            std::thread::spawn(move || {
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

fn main() {
    let args = Arguments::from_args();

    // Collect tests from the distributed slice
    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    // Run the tests and exit with the result
    libtest_mimic::run(&args, tests).exit();
}
