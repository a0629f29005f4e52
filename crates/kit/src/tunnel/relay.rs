//! Bidirectional byte relay between two established connections.
//!
//! The streams relayed here (TLS sessions, SSH channels) cannot be split
//! into independently owned read/write halves, so one thread services both
//! directions with short read timeouts instead of pairing two copy threads.
//! The relay returns only after both directions have reached end-of-stream
//! or a terminal error. Each direction drains at most a fixed read budget
//! per tick, so a close or reverse-direction byte on either side is
//! observed by the other within one poll tick even under bulk flow.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// How long a single read may block before the other direction is serviced.
pub(crate) const POLL_TICK: Duration = Duration::from_millis(100);

const COPY_BUF: usize = 16 * 1024;

/// A relayable connection: a byte stream that can half-close its write side
/// and bound how long reads block.
pub trait Wire: Read + Write + Send {
    /// Bound blocking reads (and writes where the transport supports it).
    /// `None` restores indefinite blocking.
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Signal end-of-stream to the peer without tearing down the read side.
    fn close_write(&mut self) -> io::Result<()>;
}

/// Owned, type-erased connection handed between the tunnel layers.
pub type BoxedWire = Box<dyn Wire>;

impl Wire for TcpStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn close_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

/// Whether an I/O error means "nothing ready this tick" rather than failure.
pub(crate) fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn write_fully(dst: &mut dyn Wire, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match dst.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if is_idle(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads serviced per direction per tick. A saturated direction yields
/// after this many reads so the opposite one stays responsive.
const MAX_READS_PER_TICK: usize = 64;

/// Outcome of draining one direction for one tick.
enum Drained {
    /// Source still open; nothing more ready right now.
    Idle,
    /// Source still open with this tick's read budget spent; more data may
    /// already be waiting.
    Busy,
    /// Source reached end-of-stream.
    Eof,
}

/// Copy `src` -> `dst` until the source has nothing ready, hits EOF,
/// errors, or the per-tick read budget runs out. At most one read blocks
/// for the poll tick; once data flows, the direction is drained without
/// waiting again.
fn drain(src: &mut dyn Wire, dst: &mut dyn Wire, buf: &mut [u8]) -> io::Result<Drained> {
    for _ in 0..MAX_READS_PER_TICK {
        match src.read(buf) {
            Ok(0) => return Ok(Drained::Eof),
            Ok(n) => write_fully(dst, &buf[..n])?,
            Err(e) if is_idle(&e) => return Ok(Drained::Idle),
            Err(e) => return Err(e),
        }
    }
    Ok(Drained::Busy)
}

/// Relay bytes between `left` and `right` until both directions are done.
///
/// An EOF or terminal error on one direction half-closes the other side so
/// its peer observes end-of-stream; the opposite direction keeps draining
/// until it finishes too. The first terminal error is returned once both
/// directions have wound down.
pub fn relay(mut left: BoxedWire, mut right: BoxedWire) -> io::Result<()> {
    left.set_io_timeout(Some(POLL_TICK))?;
    right.set_io_timeout(Some(POLL_TICK))?;

    let mut buf = vec![0u8; COPY_BUF];
    let mut left_open = true;
    let mut right_open = true;
    let mut first_err: Option<io::Error> = None;

    while left_open || right_open {
        if left_open {
            match drain(&mut *left, &mut *right, &mut buf) {
                Ok(Drained::Idle | Drained::Busy) => {}
                Ok(Drained::Eof) => {
                    left_open = false;
                    let _ = right.close_write();
                }
                Err(e) => {
                    left_open = false;
                    let _ = right.close_write();
                    first_err.get_or_insert(e);
                }
            }
        }
        if right_open {
            match drain(&mut *right, &mut *left, &mut buf) {
                Ok(Drained::Idle | Drained::Busy) => {}
                Ok(Drained::Eof) => {
                    right_open = false;
                    let _ = left.close_write();
                }
                Err(e) => {
                    right_open = false;
                    let _ = left.close_write();
                    first_err.get_or_insert(e);
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
