//! Connection establishment with on-demand server start.
//!
//! A connection attempt walks a small state machine:
//!
//! ```text
//! Idle -> Connecting --ok--> Connected
//!             |
//!             +--err--> SpawnAndRetry --(attempts left)--> Connecting
//!                             |
//!                             +--(exhausted)--> Failed
//! ```
//!
//! `SpawnAndRetry` asks a [`ServerLauncher`] to start hazkey-server and then
//! sleeps for the retry delay. The launcher is a trait so that callers (and
//! tests) can replace the real process spawn.

use std::ffi::OsString;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, UnixAddr};
use tracing::{debug, info, warn};

use crate::ipc::client::IpcError;
use crate::ipc::io::{wait_ready, Readiness};

/// Name of the server executable, looked up on `PATH`.
pub const SERVER_PROGRAM: &str = "hazkey-server";

/// Flag that makes a freshly started server replace any stale instance.
pub const SERVER_REPLACE_FLAG: &str = "-r";

/// Connection attempts before giving up.
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Delay after each failed attempt.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long an in-progress connect may take to become writable.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolve the per-user socket path for hazkey-server.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/hazkey-server.<uid>.sock`
/// 2. `/tmp/hazkey-server.<uid>.sock`
///
/// Computed fresh on every call so environment changes are picked up.
pub fn default_socket_path() -> PathBuf {
    socket_path_in(dirs::runtime_dir(), nix::unistd::getuid().as_raw())
}

/// Build the socket path for `uid` under `runtime_dir` (or `/tmp`).
pub fn socket_path_in(runtime_dir: Option<PathBuf>, uid: u32) -> PathBuf {
    let dir = runtime_dir
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    dir.join(format!("hazkey-server.{}.sock", uid))
}

/// Starts hazkey-server when no one is listening on the socket.
///
/// Implementations must be fire-and-forget: the connector never waits on
/// or inspects the outcome, it simply retries the connection.
pub trait ServerLauncher: Send + Sync {
    fn launch(&self);
}

impl<L: ServerLauncher + ?Sized> ServerLauncher for Arc<L> {
    fn launch(&self) {
        (**self).launch();
    }
}

/// Spawns the server as a detached background process.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    program: OsString,
    args: Vec<OsString>,
}

impl DetachedLauncher {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for DetachedLauncher {
    fn default() -> Self {
        Self::new(SERVER_PROGRAM, [SERVER_REPLACE_FLAG])
    }
}

impl ServerLauncher for DetachedLauncher {
    fn launch(&self) {
        use std::os::unix::process::CommandExt;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        match command.spawn() {
            Ok(mut child) => {
                info!(
                    "Launched {} (pid {})",
                    self.program.to_string_lossy(),
                    child.id()
                );
                // Reap the child in the background so it never lingers as a zombie.
                let reaper = thread::Builder::new()
                    .name("hazkey-server-reaper".into())
                    .spawn(move || {
                        let _ = child.wait();
                    });
                if let Err(e) = reaper {
                    debug!("Could not start reaper thread: {}", e);
                }
            }
            Err(e) => warn!(
                "Failed to launch {}: {}",
                self.program.to_string_lossy(),
                e
            ),
        }
    }
}

/// Launcher that never starts anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLauncher;

impl ServerLauncher for NoopLauncher {
    fn launch(&self) {}
}

/// Parameters for [`connect_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

enum ConnectState {
    Idle,
    Connecting { attempt: u32 },
    SpawnAndRetry { attempt: u32, error: IpcError },
    Connected(UnixStream),
    Failed { attempts: u32, last_error: Option<IpcError> },
}

/// Open a non-blocking connection to `path`, starting the server via
/// `launcher` and retrying when nobody answers.
///
/// `path` is re-resolved on every attempt.
///
/// # Errors
///
/// Returns `IpcError::RetriesExhausted` once `policy.max_attempts` attempts
/// have failed.
pub fn connect_with_retry<F>(
    resolve_path: F,
    policy: &RetryPolicy,
    launcher: &dyn ServerLauncher,
) -> Result<UnixStream, IpcError>
where
    F: Fn() -> PathBuf,
{
    let mut state = ConnectState::Idle;

    loop {
        state = match state {
            ConnectState::Idle if policy.max_attempts == 0 => ConnectState::Failed {
                attempts: 0,
                last_error: None,
            },
            ConnectState::Idle => ConnectState::Connecting { attempt: 1 },
            ConnectState::Connecting { attempt } => {
                let path = resolve_path();
                debug!(
                    "Connecting to {} (attempt {}/{})",
                    path.display(),
                    attempt,
                    policy.max_attempts
                );
                match connect_once(&path, policy.connect_timeout) {
                    Ok(stream) => ConnectState::Connected(stream),
                    Err(error) => ConnectState::SpawnAndRetry { attempt, error },
                }
            }
            ConnectState::SpawnAndRetry { attempt, error } => {
                debug!("Connection attempt {} failed: {}", attempt, error);
                launcher.launch();
                thread::sleep(policy.retry_delay);
                if attempt < policy.max_attempts {
                    ConnectState::Connecting {
                        attempt: attempt + 1,
                    }
                } else {
                    ConnectState::Failed {
                        attempts: attempt,
                        last_error: Some(error),
                    }
                }
            }
            ConnectState::Connected(stream) => return Ok(stream),
            ConnectState::Failed {
                attempts,
                last_error,
            } => {
                warn!(
                    "Giving up on hazkey-server after {} attempts{}",
                    attempts,
                    last_error
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                );
                return Err(IpcError::RetriesExhausted { attempts });
            }
        };
    }
}

/// A single non-blocking connect to `path`.
///
/// The returned stream is left in non-blocking mode. On failure the socket
/// is closed when its descriptor drops.
pub fn connect_once(path: &Path, timeout: Duration) -> Result<UnixStream, IpcError> {
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|errno| IpcError::ConnectionFailed(io::Error::from(errno)))?;

    let addr =
        UnixAddr::new(path).map_err(|errno| IpcError::ConnectionFailed(io::Error::from(errno)))?;

    match socket::connect(fd.as_raw_fd(), &addr) {
        Ok(()) => {}
        Err(Errno::EINPROGRESS) => {
            wait_ready(&fd, Readiness::Writable, timeout)?;
            let pending = socket::getsockopt(&fd, sockopt::SocketError)
                .map_err(|errno| IpcError::ConnectionFailed(io::Error::from(errno)))?;
            if pending != 0 {
                return Err(IpcError::ConnectionFailed(io::Error::from_raw_os_error(
                    pending,
                )));
            }
        }
        Err(errno) => return Err(IpcError::ConnectionFailed(io::Error::from(errno))),
    }

    Ok(UnixStream::from(fd))
}
