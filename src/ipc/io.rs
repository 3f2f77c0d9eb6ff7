//! Bounded-wait reads and writes on non-blocking sockets.
//!
//! The socket to hazkey-server is non-blocking. A `WouldBlock` from the
//! kernel is not an error here: the call parks on `poll(2)` until the socket
//! is ready again, but never longer than the per-wait timeout. Every call
//! therefore either transfers the whole buffer or fails in bounded time.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::ipc::client::IpcError;

/// Per-wait timeout for writes. The server should drain requests promptly.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-wait timeout for reads. Replies such as `get_config` may be built
/// lazily on the server side, so this is intentionally longer than writes.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Which readiness to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
}

/// Block until `fd` is ready for `readiness` or `timeout` elapses.
///
/// `POLLERR`/`POLLHUP` count as ready: the following read or write will
/// surface the actual condition. The full `timeout` is honoured even when it
/// exceeds what a single `poll(2)` call accepts.
pub fn wait_ready<F: AsFd>(
    fd: &F,
    readiness: Readiness,
    timeout: Duration,
) -> Result<(), IpcError> {
    let events = match readiness {
        Readiness::Readable => PollFlags::POLLIN,
        Readiness::Writable => PollFlags::POLLOUT,
    };
    // `None` means the deadline is beyond what `Instant` can represent.
    let deadline = Instant::now().checked_add(timeout);

    loop {
        let poll_timeout = match deadline {
            Some(deadline) => poll_timeout(deadline.saturating_duration_since(Instant::now())),
            None => PollTimeout::NONE,
        };

        let mut fds = [PollFd::new(fd.as_fd(), events)];
        match poll(&mut fds, poll_timeout) {
            Ok(0) => {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(IpcError::Timeout(timeout));
                }
            }
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(IpcError::Io(io::Error::from(errno))),
        }
    }
}

/// Milliseconds to pass to `poll(2)` for `remaining`, rounded up so that a
/// sub-millisecond wait still blocks.
fn poll_millis(remaining: Duration) -> u128 {
    remaining.as_nanos().div_ceil(1_000_000)
}

/// Longer waits are capped here and resumed by the caller's loop.
fn poll_timeout(remaining: Duration) -> PollTimeout {
    PollTimeout::try_from(poll_millis(remaining)).unwrap_or(PollTimeout::MAX)
}

/// Write the whole of `buf`, waiting up to `timeout` each time the socket
/// reports it cannot take more data.
pub fn write_all_bounded<S>(
    stream: &mut S,
    mut buf: &[u8],
    timeout: Duration,
) -> Result<(), IpcError>
where
    S: Write + AsFd,
{
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(IpcError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_ready(&*stream, Readiness::Writable, timeout)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Fill `buf` completely, waiting up to `timeout` each time no data is
/// available. End-of-stream before `buf` is full is reported as
/// [`IpcError::PeerClosed`].
pub fn read_exact_bounded<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), IpcError>
where
    S: Read + AsFd,
{
    let expected = buf.len();
    let mut received = 0;

    while received < expected {
        match stream.read(&mut buf[received..]) {
            Ok(0) => return Err(IpcError::PeerClosed { received, expected }),
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_ready(&*stream, Readiness::Readable, timeout)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().expect("Failed to create socket pair");
        a.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_read_waits_for_late_data() {
        let (mut client, mut server) = nonblocking_pair();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            server.write_all(b"he").unwrap();
            thread::sleep(Duration::from_millis(50));
            server.write_all(b"llo").unwrap();
            server
        });

        let mut buf = [0u8; 5];
        read_exact_bounded(&mut client, &mut buf, Duration::from_secs(2)).unwrap();
        assert_eq!(&buf, b"hello");
        writer.join().unwrap();
    }

    #[test]
    fn test_read_times_out() {
        let (mut client, _server) = nonblocking_pair();

        let start = Instant::now();
        let mut buf = [0u8; 4];
        let err =
            read_exact_bounded(&mut client, &mut buf, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)), "got {:?}", err);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_sub_millisecond_timeout_still_waits() {
        let (client, _server) = nonblocking_pair();
        let timeout = Duration::from_micros(900);

        let start = Instant::now();
        let err = wait_ready(&client, Readiness::Readable, timeout).unwrap_err();
        assert!(matches!(err, IpcError::Timeout(t) if t == timeout), "got {:?}", err);
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_poll_millis_rounds_up_and_keeps_long_waits() {
        assert_eq!(poll_millis(Duration::ZERO), 0);
        assert_eq!(poll_millis(Duration::from_micros(900)), 1);
        assert_eq!(poll_millis(Duration::from_micros(1_001)), 2);
        assert_eq!(poll_millis(Duration::from_secs(70)), 70_000);
    }

    #[test]
    fn test_wait_ready_returns_when_data_arrives() {
        let (client, mut server) = nonblocking_pair();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            server.write_all(b"x").unwrap();
            server
        });

        // Longer than a single poll(2) call can express in a u16.
        wait_ready(&client, Readiness::Readable, Duration::from_secs(70)).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_read_reports_peer_closed() {
        let (mut client, mut server) = nonblocking_pair();
        server.write_all(b"ab").unwrap();
        drop(server);

        let mut buf = [0u8; 4];
        let err = read_exact_bounded(&mut client, &mut buf, Duration::from_secs(1)).unwrap_err();
        match err {
            IpcError::PeerClosed { received, expected } => {
                assert_eq!(received, 2);
                assert_eq!(expected, 4);
            }
            other => panic!("Expected PeerClosed, got {:?}", other),
        }
    }

    #[test]
    fn test_write_larger_than_socket_buffer() {
        let (mut client, mut server) = nonblocking_pair();
        let payload = vec![0x5au8; 1024 * 1024];
        let expected = payload.len();

        let reader = thread::spawn(move || {
            let mut sink = vec![0u8; expected];
            server.read_exact(&mut sink).unwrap();
            sink
        });

        write_all_bounded(&mut client, &payload, Duration::from_secs(2)).unwrap();
        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn test_write_times_out_when_peer_never_reads() {
        let (mut client, _server) = nonblocking_pair();
        let payload = vec![0u8; 8 * 1024 * 1024];

        let err = write_all_bounded(&mut client, &payload, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)), "got {:?}", err);
    }
}
