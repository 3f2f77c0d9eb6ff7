//! Client side of the hazkey-server transaction protocol.
//!
//! The settings tool talks to the long-lived conversion server over a
//! per-user Unix domain socket:
//!
//! ```text
//! ┌─────────────────────┐       Unix Socket        ┌─────────────────────┐
//! │  hazkey-settings    │  ◄─────────────────────► │   hazkey-server     │
//! │  (ServerConnector)  │   u32 BE length + body   │                     │
//! └─────────────────────┘                          └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Every request frame is answered by exactly one response frame. There
//! are no request IDs and no pipelining, so `ServerConnector` serializes all
//! exchanges behind one lock.
//!
//! If nobody is listening, the connector starts `hazkey-server -r` in the
//! background and retries a few times before giving up.
//!
//! # Usage
//!
//! ```ignore
//! use hazkey_settings::ipc::ServerConnector;
//!
//! let server = ServerConnector::default();
//! let config = server.get_config();
//!
//! if server.begin_session() {
//!     server.reload_zenzai_model_in_session();
//!     let refreshed = server.get_config_in_session();
//!     server.end_session();
//! }
//! ```

mod client;
mod connect;
mod framing;
mod io;

pub use client::{ConnectorConfig, IpcError, ServerConnector, SERVER_PROGRAM_ENV};
pub use connect::{
    connect_once, connect_with_retry, default_socket_path, socket_path_in, DetachedLauncher,
    NoopLauncher, RetryPolicy, ServerLauncher, CONNECT_TIMEOUT, MAX_CONNECT_ATTEMPTS, RETRY_DELAY,
    SERVER_PROGRAM, SERVER_REPLACE_FLAG,
};
pub use framing::{
    decode, decode_body, encode, encode_frame, read_frame, write_frame, HEADER_LEN,
    MAX_FRAME_SIZE,
};
pub use io::{
    read_exact_bounded, wait_ready, write_all_bounded, Readiness, READ_TIMEOUT, WRITE_TIMEOUT,
};
