//! Transaction coordinator for hazkey-server.
//!
//! `ServerConnector` is the only type GUI and addon code should talk to. It
//! offers two ways of reaching the server:
//!
//! - one-shot transactions (`transact` and the helpers built on it) that
//!   open a connection, exchange one frame pair and close it again;
//! - sessions (`begin_session` .. `end_session`) that keep a single
//!   connection open across several exchanges.
//!
//! Both go through one lock owned by the connector. The wire protocol has no
//! request IDs, so at most one exchange may be in flight at a time.

use std::env;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use prost::Message;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ipc::connect::{
    connect_with_retry, default_socket_path, DetachedLauncher, RetryPolicy, ServerLauncher,
    SERVER_PROGRAM, SERVER_REPLACE_FLAG,
};
use crate::ipc::framing::{decode_body, read_frame, write_frame, MAX_FRAME_SIZE};
use crate::ipc::io::{READ_TIMEOUT, WRITE_TIMEOUT};
use crate::models::{CurrentConfig, RequestEnvelope, Response, ResponseEnvelope, ResponsePayload};

/// Environment variable overriding the server executable.
pub const SERVER_PROGRAM_ENV: &str = "HAZKEY_SERVER";

/// IPC-specific error types.
///
/// The public `ServerConnector` API folds all of these into `None`/`false`;
/// the `try_*` methods expose them for callers that want diagnostics.
#[derive(Debug, Error)]
pub enum IpcError {
    /// A single connection attempt failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    /// Every connection attempt failed.
    #[error("Could not reach hazkey-server after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The socket did not become ready in time.
    #[error("Timed out after {0:?} waiting for the socket")]
    Timeout(Duration),

    /// The server closed the connection in the middle of a frame.
    #[error("Connection closed by server after {received} of {expected} bytes")]
    PeerClosed { received: usize, expected: usize },

    /// A frame length beyond the accepted maximum.
    #[error("Frame of {len} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { len: u64, max: u64 },

    /// The response body is not a valid envelope.
    #[error("Failed to parse response: {0}")]
    Decode(#[source] prost::DecodeError),

    /// The server answered with a non-success status.
    #[error("Server reported failure: {}", .0.as_deref().unwrap_or("no reason given"))]
    ServerFailure(Option<String>),

    /// A success response lacked the payload the request implies.
    #[error("Response to {0} carries no payload")]
    MissingPayload(&'static str),

    /// A session call was made with no session open.
    #[error("No session is open")]
    NoSession,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                IpcError::ConnectionFailed(err)
            }
            _ => IpcError::Io(err),
        }
    }
}

/// Tunables for a [`ServerConnector`].
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Fixed socket path. `None` recomputes [`default_socket_path`] on every
    /// connection attempt.
    pub socket_path: Option<PathBuf>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub max_frame_size: u32,
    /// Executable started when nobody listens on the socket.
    pub server_program: String,
    pub server_args: Vec<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            socket_path: None,
            max_attempts: retry.max_attempts,
            retry_delay: retry.retry_delay,
            connect_timeout: retry.connect_timeout,
            write_timeout: WRITE_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            server_program: env::var(SERVER_PROGRAM_ENV)
                .ok()
                .filter(|program| !program.is_empty())
                .unwrap_or_else(|| SERVER_PROGRAM.to_string()),
            server_args: vec![SERVER_REPLACE_FLAG.to_string()],
        }
    }
}

impl ConnectorConfig {
    /// Default configuration talking to a fixed socket path.
    pub fn with_socket_path(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: Some(path.into()),
            ..Self::default()
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Client side of the hazkey-server transaction protocol.
///
/// # Example
///
/// ```ignore
/// use hazkey_settings::ipc::ServerConnector;
///
/// let server = ServerConnector::default();
/// if let Some(mut config) = server.get_config() {
///     config.profiles.truncate(1);
///     server.set_current_config(&config);
/// }
/// ```
pub struct ServerConnector {
    config: ConnectorConfig,
    launcher: Box<dyn ServerLauncher>,
    /// Serializes every exchange; holds the session connection if one is open.
    session: Mutex<Option<UnixStream>>,
}

impl std::fmt::Debug for ServerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for ServerConnector {
    fn default() -> Self {
        Self::new(ConnectorConfig::default())
    }
}

impl ServerConnector {
    /// Create a connector that starts the configured server binary on demand.
    pub fn new(config: ConnectorConfig) -> Self {
        let launcher = DetachedLauncher::new(
            config.server_program.clone(),
            config.server_args.iter().cloned(),
        );
        Self::with_launcher(config, launcher)
    }

    /// Create a connector with a custom server launcher.
    pub fn with_launcher(config: ConnectorConfig, launcher: impl ServerLauncher + 'static) -> Self {
        Self {
            config,
            launcher: Box::new(launcher),
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// The socket path the next connection attempt would use.
    pub fn socket_path(&self) -> PathBuf {
        self.config
            .socket_path
            .clone()
            .unwrap_or_else(default_socket_path)
    }

    // =========================================================================
    // One-shot transactions
    // =========================================================================

    /// Exchange one opaque frame body over a fresh connection.
    pub fn try_transact_raw(&self, body: &[u8]) -> Result<Vec<u8>, IpcError> {
        let _guard = self.lock();
        let mut stream = self.connect()?;
        let reply = self.exchange(&mut stream, body);
        close(stream);
        reply
    }

    /// [`try_transact_raw`](Self::try_transact_raw) with errors folded into `None`.
    pub fn transact_raw(&self, body: &[u8]) -> Option<Vec<u8>> {
        self.try_transact_raw(body)
            .map_err(|e| warn!("Raw transaction failed: {}", e))
            .ok()
    }

    /// Send `request` over a fresh connection and return the gated response.
    pub fn try_transact(&self, request: &RequestEnvelope) -> Result<Response, IpcError> {
        let body = request.encode_to_vec();
        debug!("Sending {} ({} bytes)", request.kind(), body.len());
        let reply = self.try_transact_raw(&body)?;
        parse_response(&reply)
    }

    /// One-shot transaction. `None` on any connection, framing or decode failure.
    pub fn transact(&self, request: &RequestEnvelope) -> Option<Response> {
        self.try_transact(request)
            .map_err(|e| warn!("Transaction {} failed: {}", request.kind(), e))
            .ok()
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open a persistent connection, replacing any session already open.
    ///
    /// The lock is held only while connecting, not for the session lifetime.
    pub fn begin_session(&self) -> bool {
        let mut session = self.lock();

        if let Some(previous) = session.take() {
            debug!("Replacing open session");
            close(previous);
        }

        match self.connect() {
            Ok(stream) => {
                info!("Session opened on {}", self.socket_path().display());
                *session = Some(stream);
                true
            }
            Err(e) => {
                warn!("Failed to open session: {}", e);
                false
            }
        }
    }

    /// Close the session connection if one is open.
    pub fn end_session(&self) {
        if let Some(stream) = self.lock().take() {
            close(stream);
            info!("Session closed");
        }
    }

    pub fn has_session(&self) -> bool {
        self.lock().is_some()
    }

    /// Send `request` on the session connection.
    ///
    /// A transport failure leaves the stream in an unknown position, so the
    /// session is closed; a server-side failure status keeps it open.
    pub fn try_transact_in_session(
        &self,
        request: &RequestEnvelope,
    ) -> Result<Response, IpcError> {
        let body = request.encode_to_vec();

        let mut session = self.lock();
        let stream = session.as_mut().ok_or(IpcError::NoSession)?;
        debug!("Sending {} in session ({} bytes)", request.kind(), body.len());

        match self.exchange(stream, &body) {
            Ok(reply) => parse_response(&reply),
            Err(e) => {
                if let Some(stream) = session.take() {
                    close(stream);
                }
                Err(e)
            }
        }
    }

    /// Session transaction. `None` when no session is open or the exchange fails.
    pub fn transact_in_session(&self, request: &RequestEnvelope) -> Option<Response> {
        self.try_transact_in_session(request)
            .map_err(|e| warn!("Session transaction {} failed: {}", request.kind(), e))
            .ok()
    }

    pub fn get_config_in_session(&self) -> Option<CurrentConfig> {
        let request = RequestEnvelope::get_config();
        expect_config(&request, self.transact_in_session(&request))
    }

    pub fn reload_zenzai_model_in_session(&self) -> bool {
        let request = RequestEnvelope::reload_zenzai_model();
        expect_success(&request, self.transact_in_session(&request))
    }

    // =========================================================================
    // Request helpers
    // =========================================================================

    /// Fetch the current configuration. `None` also covers failure replies.
    pub fn get_config(&self) -> Option<CurrentConfig> {
        let request = RequestEnvelope::get_config();
        expect_config(&request, self.transact(&request))
    }

    /// Replace the server's profiles with those of `config`.
    pub fn set_current_config(&self, config: &CurrentConfig) -> bool {
        let request = RequestEnvelope::set_config(config);
        expect_success(&request, self.transact(&request))
    }

    pub fn clear_all_history(&self, profile_id: &str) -> bool {
        let request = RequestEnvelope::clear_all_history(profile_id);
        expect_success(&request, self.transact(&request))
    }

    pub fn reload_zenzai_model(&self) -> bool {
        let request = RequestEnvelope::reload_zenzai_model();
        expect_success(&request, self.transact(&request))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Take the exchange lock.
    ///
    /// A panic while holding it may have left the session stream mid-frame,
    /// so a poisoned lock drops the session.
    fn lock(&self) -> MutexGuard<'_, Option<UnixStream>> {
        self.session.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            let mut guard = poisoned.into_inner();
            if let Some(stream) = guard.take() {
                close(stream);
            }
            self.session.clear_poison();
            guard
        })
    }

    fn connect(&self) -> Result<UnixStream, IpcError> {
        connect_with_retry(
            || self.socket_path(),
            &self.config.retry_policy(),
            self.launcher.as_ref(),
        )
    }

    fn exchange(&self, stream: &mut UnixStream, body: &[u8]) -> Result<Vec<u8>, IpcError> {
        write_frame(stream, body, self.config.write_timeout)?;
        read_frame(stream, self.config.max_frame_size, self.config.read_timeout)
    }
}

impl Drop for ServerConnector {
    fn drop(&mut self) {
        self.end_session();
    }
}

fn close(stream: UnixStream) {
    let _ = stream.shutdown(Shutdown::Both);
}

fn parse_response(body: &[u8]) -> Result<Response, IpcError> {
    let envelope: ResponseEnvelope = decode_body(body)?;
    Ok(Response::from(envelope))
}

fn expect_success(request: &RequestEnvelope, response: Option<Response>) -> bool {
    match response {
        Some(Response::Success(_)) => true,
        Some(Response::Failure { message }) => {
            warn!("{}: {}", request.kind(), IpcError::ServerFailure(message));
            false
        }
        None => false,
    }
}

fn expect_config(request: &RequestEnvelope, response: Option<Response>) -> Option<CurrentConfig> {
    match response? {
        Response::Success(Some(ResponsePayload::CurrentConfig(config))) => Some(config),
        Response::Success(None) => {
            warn!("{}", IpcError::MissingPayload(request.kind()));
            None
        }
        Response::Failure { message } => {
            warn!("{}: {}", request.kind(), IpcError::ServerFailure(message));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_display() {
        let timeout_err = IpcError::Timeout(Duration::from_secs(10));
        assert_eq!(
            timeout_err.to_string(),
            "Timed out after 10s waiting for the socket"
        );

        let server_err = IpcError::ServerFailure(Some("profile not found".into()));
        assert_eq!(
            server_err.to_string(),
            "Server reported failure: profile not found"
        );
        assert_eq!(
            IpcError::ServerFailure(None).to_string(),
            "Server reported failure: no reason given"
        );

        let frame_err = IpcError::FrameTooLarge {
            len: 3_000_000,
            max: 2_097_152,
        };
        assert_eq!(
            frame_err.to_string(),
            "Frame of 3000000 bytes exceeds maximum 2097152 bytes"
        );
    }

    #[test]
    fn test_ipc_error_from_io() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "not found");
        let ipc_err: IpcError = not_found.into();
        assert!(matches!(ipc_err, IpcError::ConnectionFailed(_)));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let ipc_err: IpcError = refused.into();
        assert!(matches!(ipc_err, IpcError::ConnectionFailed(_)));

        let other = io::Error::new(io::ErrorKind::Other, "other");
        let ipc_err: IpcError = other.into();
        assert!(matches!(ipc_err, IpcError::Io(_)));
    }

    #[test]
    fn test_default_config_values() {
        let config = ConnectorConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert!(config.read_timeout > config.write_timeout);
        assert_eq!(config.max_frame_size, 2_097_152);
        assert_eq!(config.server_args, vec!["-r".to_string()]);
        assert!(config.socket_path.is_none());
    }

    #[test]
    fn test_session_calls_fail_fast_without_session() {
        let connector = ServerConnector::with_launcher(
            ConnectorConfig::with_socket_path("/nonexistent/hazkey.sock"),
            crate::ipc::connect::NoopLauncher,
        );

        assert!(!connector.has_session());
        assert!(matches!(
            connector.try_transact_in_session(&RequestEnvelope::get_config()),
            Err(IpcError::NoSession)
        ));
        assert_eq!(connector.get_config_in_session(), None);
        assert!(!connector.reload_zenzai_model_in_session());
        connector.end_session();
    }

    #[test]
    fn test_expect_config_requires_payload() {
        let request = RequestEnvelope::get_config();
        assert_eq!(expect_config(&request, Some(Response::Success(None))), None);
        assert_eq!(expect_config(&request, None), None);

        let config = CurrentConfig::default();
        assert_eq!(
            expect_config(
                &request,
                Some(Response::Success(Some(ResponsePayload::CurrentConfig(
                    config.clone()
                ))))
            ),
            Some(config)
        );
    }

    #[test]
    fn test_parse_response_gates_on_status() {
        let envelope = ResponseEnvelope {
            current_config: Some(CurrentConfig::default()),
            ..ResponseEnvelope::failed("")
        };
        let response = parse_response(&envelope.encode_to_vec()).unwrap();
        assert_eq!(response, Response::Failure { message: None });

        let garbled = parse_response(b"\xff\x00").unwrap_err();
        assert!(matches!(garbled, IpcError::Decode(_)), "got {:?}", garbled);
    }
}
