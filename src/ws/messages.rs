//! WebSocket message types and the frame codec.
//!
//! Inbound text frames decode into [`ServerMessage`]; outbound frames are
//! built by [`encode_command`] and [`AuthMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::RequestId;
use crate::error::ClientError;

/// Structured error carried by `result` and `auth_invalid` frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (e.g. `unknown_command`).
    #[serde(default)]
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Message received from the server, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame of every connection.
    AuthRequired {
        /// Server version, if announced.
        #[serde(default)]
        ha_version: Option<String>,
    },

    /// The access token was accepted.
    AuthOk {
        /// Server version, if announced.
        #[serde(default)]
        ha_version: Option<String>,
    },

    /// The access token was rejected.
    AuthInvalid {
        /// Flat message form.
        #[serde(default)]
        message: Option<String>,
        /// Structured error form.
        #[serde(default)]
        error: Option<ErrorBody>,
    },

    /// Response to a command.
    Result {
        /// Correlation id of the command.
        id: RequestId,
        /// Whether the command succeeded.
        success: bool,
        /// Payload on success.
        #[serde(default)]
        result: Option<Value>,
        /// Error on failure.
        #[serde(default)]
        error: Option<ErrorBody>,
    },

    /// Push event for a subscription.
    Event {
        /// Id of the command that created the subscription.
        id: RequestId,
        /// Event payload.
        #[serde(default)]
        event: Value,
    },

    /// Response to a `ping` command.
    Pong {
        /// Correlation id of the ping.
        id: RequestId,
    },

    /// Any `type` this client does not handle.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Returns the wire `type` of this message.
    #[must_use]
    pub const fn type_str(&self) -> &'static str {
        match self {
            Self::AuthRequired { .. } => "auth_required",
            Self::AuthOk { .. } => "auth_ok",
            Self::AuthInvalid { .. } => "auth_invalid",
            Self::Result { .. } => "result",
            Self::Event { .. } => "event",
            Self::Pong { .. } => "pong",
            Self::Unknown => "unknown",
        }
    }

    /// Returns the message text of an `auth_invalid` frame, preferring the
    /// structured form.
    #[must_use]
    pub fn auth_invalid_reason(&self) -> Option<String> {
        let Self::AuthInvalid { message, error } = self else {
            return None;
        };
        error
            .as_ref()
            .map(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .or_else(|| message.clone().filter(|m| !m.is_empty()))
    }
}

/// Decodes one inbound text frame.
///
/// # Errors
///
/// Returns [`ClientError::Protocol`] if the frame is not a JSON object with
/// a `type` field, or a known type is missing required fields.
pub fn decode(text: &str) -> Result<ServerMessage, ClientError> {
    serde_json::from_str(text).map_err(|e| ClientError::Protocol(format!("bad frame: {e}")))
}

/// Authentication message sent after `auth_required`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    access_token: &'a str,
}

impl<'a> AuthMessage<'a> {
    /// Builds the `auth` message for `token`.
    #[must_use]
    pub const fn new(token: &'a str) -> Self {
        Self {
            msg_type: "auth",
            access_token: token,
        }
    }

    /// Serializes the message to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Encodes a command frame `{id, type, ...params}`.
///
/// `params` must be a JSON object or `null`. Its `id` and `type` keys, if
/// any, are overridden.
///
/// # Errors
///
/// Returns [`ClientError::Protocol`] if `params` is neither an object nor
/// `null`.
pub fn encode_command(id: RequestId, command: &str, params: Value) -> Result<String, ClientError> {
    let mut frame = match params {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        other => {
            return Err(ClientError::Protocol(format!(
                "command parameters must be an object, got {other}"
            )));
        }
    };
    frame.insert("id".to_string(), Value::from(id.get()));
    frame.insert("type".to_string(), Value::String(command.to_string()));
    Ok(serde_json::to_string(&frame)?)
}
