//! Wire message kinds, discriminated by the `name` field.

use relay_core::ids::ListenerKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope;
use crate::error::WireError;

/// Whether a response carries a result or an error body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseState {
    /// The command completed; `body` is its result.
    Success,
    /// The command failed; `body` is an [`ErrorBody`].
    Error,
}

/// Structured error payload inside an error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable code (see [`relay_core::codes`]).
    pub code: String,
    /// Diagnostic detail, populated only outside production mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorBody {
    /// Build an error body without diagnostic detail.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            stack: None,
        }
    }

    /// Attach diagnostic detail (non-production only).
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// The closed set of wire message kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Client-issued command invocation.
    #[serde(rename_all = "camelCase")]
    Request {
        /// Correlation id linking the eventual response.
        uuid: String,
        /// `serviceName.methodName` or a built-in command.
        command: String,
        /// Positional arguments.
        #[serde(default)]
        params: Vec<Value>,
    },

    /// One chunk of a request too large for a single frame.
    #[serde(rename_all = "camelCase")]
    RequestSplit {
        /// Correlation id of the split request.
        uuid: String,
        /// Zero-based chunk index.
        index: u64,
        /// Byte length of the full serialized request.
        full_size: u64,
        /// This chunk's slice of the serialized request.
        body: String,
    },

    /// Server reply to a request.
    #[serde(rename_all = "camelCase")]
    Response {
        /// Correlation id echoed from the request.
        req_uuid: String,
        /// Success or error.
        state: ResponseState,
        /// Result value, or an [`ErrorBody`] when `state` is `error`.
        body: Value,
    },

    /// One chunk of a response too large for a single frame.
    #[serde(rename_all = "camelCase")]
    ResponseSplit {
        /// Correlation id echoed from the request.
        req_uuid: String,
        /// Byte length of the full serialized response.
        full_size: u64,
        /// Zero-based chunk index.
        index: u64,
        /// This chunk's slice of the serialized response.
        body: String,
    },

    /// Server-pushed event delivered to one listener key.
    #[serde(rename_all = "camelCase")]
    Event {
        /// Listener registration key this payload targets.
        key: ListenerKey,
        /// Event payload.
        body: Value,
    },

    /// Server asks the client to declare its stable identity.
    ClientGetId,

    /// Client's answer to [`WireMessage::ClientGetId`].
    #[serde(rename_all = "camelCase")]
    ClientGetIdResponse {
        /// The declared client id.
        body: String,
    },

    /// Server signals the connection is admitted.
    Connected,

    /// Server asks clients to reload after a file change.
    #[serde(rename_all = "camelCase")]
    ClientReload {
        /// Target client name; absent means every client.
        #[serde(skip_serializing_if = "Option::is_none")]
        client_name: Option<String>,
        /// Paths that changed.
        changed_file_set: Vec<String>,
    },
}

impl WireMessage {
    /// Build a request with a fresh correlation id (UUID v7, time-ordered).
    pub fn request(command: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Request {
            uuid: uuid::Uuid::now_v7().to_string(),
            command: command.into(),
            params,
        }
    }

    /// Build a success response.
    pub fn response_success(req_uuid: impl Into<String>, body: Value) -> Self {
        Self::Response {
            req_uuid: req_uuid.into(),
            state: ResponseState::Success,
            body,
        }
    }

    /// Build an error response.
    pub fn response_error(req_uuid: impl Into<String>, error: ErrorBody) -> Self {
        Self::Response {
            req_uuid: req_uuid.into(),
            state: ResponseState::Error,
            body: serde_json::json!(error),
        }
    }

    /// The message kind string as it appears in the `name` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::RequestSplit { .. } => "request-split",
            Self::Response { .. } => "response",
            Self::ResponseSplit { .. } => "response-split",
            Self::Event { .. } => "event",
            Self::ClientGetId => "client-get-id",
            Self::ClientGetIdResponse { .. } => "client-get-id-response",
            Self::Connected => "connected",
            Self::ClientReload { .. } => "client-reload",
        }
    }
}

/// Serialize a message to a text frame.
pub fn encode_frame(message: &WireMessage) -> Result<String, WireError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse a text frame, rejecting unknown message kinds and unknown value
/// envelope tags anywhere in the payload.
pub fn decode_frame(frame: &str) -> Result<WireMessage, WireError> {
    let message: WireMessage = serde_json::from_str(frame)?;
    match &message {
        WireMessage::Request { params, .. } => {
            for param in params {
                envelope::check_value(param)?;
            }
        }
        WireMessage::Response { body, .. } | WireMessage::Event { body, .. } => {
            envelope::check_value(body)?;
        }
        _ => {}
    }
    Ok(message)
}
