//! hazkey settings library
//!
//! This library provides the pieces the settings tool needs to talk to
//! hazkey-server:
//!
//! - `ipc` - framing, connection handling and the `ServerConnector`
//! - `models` - request/response envelopes and the configuration record
//!
//! # IPC Module
//!
//! ```ignore
//! use hazkey_settings::ipc::ServerConnector;
//!
//! let server = ServerConnector::default();
//! if let Some(config) = server.get_config() {
//!     println!("{} profiles", config.profiles.len());
//! }
//! ```

pub mod ipc;
pub mod models;
