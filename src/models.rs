//! Envelope and configuration messages exchanged with hazkey-server.
//!
//! Frame bodies are protobuf. The protocol layer only cares about which
//! request variant is sent and the status of the reply; the configuration
//! messages mirror the fields the settings tool reads and writes.

use prost::{Enumeration, Message};
use serde::{Deserialize, Serialize};

/// A single request sent to the server.
///
/// Exactly one payload variant is populated per transaction. The
/// constructors below are the only supported way to build one; an envelope
/// without a payload is never dispatchable.
#[derive(Clone, PartialEq, Message)]
pub struct RequestEnvelope {
    #[prost(oneof = "request_envelope::Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<request_envelope::Payload>,
}

pub mod request_envelope {
    use super::{ClearAllHistory, GetConfig, ReloadZenzaiModel, SetConfig};

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        /// Fetch the server's current configuration.
        #[prost(message, tag = "1")]
        GetConfig(GetConfig),
        /// Replace the server's profile list.
        #[prost(message, tag = "2")]
        SetConfig(SetConfig),
        /// Drop the learned conversion history of one profile.
        #[prost(message, tag = "3")]
        ClearAllHistory(ClearAllHistory),
        /// Reload the Zenzai neural model from disk.
        #[prost(message, tag = "4")]
        ReloadZenzaiModel(ReloadZenzaiModel),
    }
}

use request_envelope::Payload;

impl RequestEnvelope {
    fn with_payload(payload: Payload) -> Self {
        Self {
            payload: Some(payload),
        }
    }

    pub fn get_config() -> Self {
        Self::with_payload(Payload::GetConfig(GetConfig {}))
    }

    /// Build a `SetConfig` request carrying the profiles of `config`.
    pub fn set_config(config: &CurrentConfig) -> Self {
        Self::with_payload(Payload::SetConfig(SetConfig {
            profiles: config.profiles.clone(),
        }))
    }

    /// Build a `ClearAllHistory` request for `profile_id`.
    pub fn clear_all_history(profile_id: impl Into<String>) -> Self {
        Self::with_payload(Payload::ClearAllHistory(ClearAllHistory {
            profile_id: profile_id.into(),
        }))
    }

    pub fn reload_zenzai_model() -> Self {
        Self::with_payload(Payload::ReloadZenzaiModel(ReloadZenzaiModel {}))
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Some(Payload::GetConfig(_)) => "get_config",
            Some(Payload::SetConfig(_)) => "set_config",
            Some(Payload::ClearAllHistory(_)) => "clear_all_history",
            Some(Payload::ReloadZenzaiModel(_)) => "reload_zenzai_model",
            None => "empty",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct GetConfig {}

/// Payload of a `set_config` request.
#[derive(Clone, PartialEq, Message)]
pub struct SetConfig {
    #[prost(message, repeated, tag = "1")]
    pub profiles: Vec<Profile>,
}

/// Payload of a `clear_all_history` request.
#[derive(Clone, PartialEq, Message)]
pub struct ClearAllHistory {
    #[prost(string, tag = "1")]
    pub profile_id: String,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct ReloadZenzaiModel {}

/// Status code carried by every response.
///
/// A missing or unrecognized code decodes as `Unspecified`; anything but
/// `Success` is treated as failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum Status {
    Unspecified = 0,
    Success = 1,
    Failed = 2,
}

/// Response as it appears on the wire.
///
/// A payload may be structurally present next to a failure status. Callers
/// should never read it directly; convert into [`Response`] instead.
#[derive(Clone, PartialEq, Message)]
pub struct ResponseEnvelope {
    #[prost(enumeration = "Status", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(message, optional, tag = "3")]
    pub current_config: Option<CurrentConfig>,
}

/// Typed payload of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    CurrentConfig(CurrentConfig),
}

/// A response after status gating.
///
/// `Success` is the only variant that can hold a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Option<ResponsePayload>),
    Failure { message: Option<String> },
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    /// The configuration carried by a successful response, if any.
    pub fn into_current_config(self) -> Option<CurrentConfig> {
        match self {
            Response::Success(Some(ResponsePayload::CurrentConfig(config))) => Some(config),
            Response::Success(None) | Response::Failure { .. } => None,
        }
    }
}

impl From<ResponseEnvelope> for Response {
    fn from(envelope: ResponseEnvelope) -> Self {
        match Status::try_from(envelope.status) {
            Ok(Status::Success) => {
                Response::Success(envelope.current_config.map(ResponsePayload::CurrentConfig))
            }
            Ok(Status::Failed | Status::Unspecified) | Err(_) => Response::Failure {
                message: Some(envelope.error_message).filter(|m| !m.is_empty()),
            },
        }
    }
}

/// The server's configuration record.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentConfig {
    #[prost(message, repeated, tag = "1")]
    pub profiles: Vec<Profile>,
    #[prost(string, tag = "2")]
    pub xdg_config_home_path: String,
    #[prost(bool, tag = "3")]
    pub zenzai_model_available: bool,
    #[prost(string, tag = "4")]
    pub zenzai_model_path: String,
    #[prost(message, repeated, tag = "5")]
    pub available_tables: Vec<NamedResource>,
    #[prost(message, repeated, tag = "6")]
    pub available_keymaps: Vec<NamedResource>,
    #[prost(message, repeated, tag = "7")]
    pub available_zenzai_backend_devices: Vec<BackendDevice>,
}

/// A conversion table or keymap, either shipped with hazkey or user-provided.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedResource {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bool, tag = "2")]
    pub is_built_in: bool,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendDevice {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub desc: String,
}

/// One conversion profile.
///
/// Mode fields hold the raw protobuf enum values.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    #[prost(string, tag = "1")]
    pub profile_id: String,
    #[prost(string, tag = "2")]
    pub profile_name: String,
    #[prost(int32, tag = "3")]
    pub num_candidates_per_page: i32,
    #[prost(int32, tag = "4")]
    pub num_suggestions: i32,
    #[prost(bool, tag = "5")]
    pub use_input_history: bool,
    #[prost(bool, tag = "6")]
    pub stop_store_new_history: bool,
    #[prost(int32, tag = "7")]
    pub auto_convert_mode: i32,
    #[prost(int32, tag = "8")]
    pub aux_text_mode: i32,
    #[prost(int32, tag = "9")]
    pub suggestion_list_mode: i32,
    #[prost(string, tag = "10")]
    pub submode_entry_point_chars: String,
    #[prost(message, repeated, tag = "11")]
    pub enabled_tables: Vec<NamedResource>,
    #[prost(message, repeated, tag = "12")]
    pub enabled_keymaps: Vec<NamedResource>,
    #[prost(bool, tag = "13")]
    pub zenzai_enable: bool,
    #[prost(int32, tag = "14")]
    pub zenzai_infer_limit: i32,
    #[prost(bool, tag = "15")]
    pub zenzai_contextual_mode: bool,
    #[prost(string, tag = "16")]
    pub zenzai_profile: String,
    #[prost(string, tag = "17")]
    pub zenzai_backend_device_name: String,
}

#[cfg(test)]
impl ResponseEnvelope {
    /// A bare success reply.
    pub(crate) fn success() -> Self {
        Self {
            status: Status::Success as i32,
            ..Default::default()
        }
    }

    /// A success reply carrying a configuration.
    pub(crate) fn with_config(config: CurrentConfig) -> Self {
        Self {
            current_config: Some(config),
            ..Self::success()
        }
    }

    /// A failure reply with a human readable reason.
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed as i32,
            error_message: message.into(),
            current_config: None,
        }
    }
}
