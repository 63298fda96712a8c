//! JSON-RPC 2.0 message layer
//!
//! Implements the JSON-RPC 2.0 envelope used by the Language Server
//! Protocol: requests, notifications and responses, with strict
//! `jsonrpc: "2.0"` validation on decode. Payloads (`params`, `result`)
//! are transported opaquely as JSON values; this layer never interprets
//! LSP method semantics.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

pub mod framing;

// ============================================================================
// JSON-RPC 2.0 Constants
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of the cancellation notification
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// JSON-RPC 2.0 error codes (as per JSON-RPC specification)
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    /// Parse error - Invalid JSON was received by the server.
    pub const PARSE_ERROR: i64 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;

    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;

    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i64 = -32602;

    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ============================================================================
// Error Object
// ============================================================================

/// JSON-RPC error object carried by failed responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code
    pub code: i64,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object with no extra data
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// "Method not found" error for an unhandled inbound request
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    /// Internal error wrapping a handler failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

// ============================================================================
// Message Errors
// ============================================================================

/// Errors produced while building or decoding messages
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON-RPC message: {0}")]
    Invalid(String),

    #[error("unsupported jsonrpc version: {0:?}")]
    Version(String),

    #[error("response carries neither result nor error")]
    EmptyResponse,

    #[error("message serialization failed: {0}")]
    Encode(String),
}

// ============================================================================
// Message
// ============================================================================

/// A JSON-RPC 2.0 envelope: request, notification or response.
///
/// Every encoded message carries `jsonrpc: "2.0"`; decoding rejects any
/// payload where the field is absent or different.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Outbound or server-to-client request; expects a response for `id`
    Request {
        id: i64,
        method: String,
        params: Value,
    },

    /// Fire-and-forget message without an id
    Notification { method: String, params: Value },

    /// Answer to a request; exactly one of `result`/`error` is present.
    /// `result: Some(Value::Null)` models an explicit `"result": null`.
    Response {
        id: i64,
        result: Option<Value>,
        error: Option<ErrorObject>,
    },
}

impl Message {
    /// Build a request
    pub fn request(id: i64, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a notification
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a response.
    ///
    /// Policy: when both `result` and `error` are supplied, the error wins
    /// and the result is discarded; a response with neither fails with
    /// [`MessageError::EmptyResponse`].
    pub fn response(
        id: i64,
        result: Option<Value>,
        error: Option<ErrorObject>,
    ) -> Result<Self, MessageError> {
        match (result, error) {
            (None, None) => Err(MessageError::EmptyResponse),
            (result, Some(error)) => {
                if result.is_some() {
                    debug!(id, "response built with both result and error; keeping error");
                }
                Ok(Message::Response {
                    id,
                    result: None,
                    error: Some(error),
                })
            }
            (Some(result), None) => Ok(Message::Response {
                id,
                result: Some(result),
                error: None,
            }),
        }
    }

    /// Build the `$/cancelRequest` notification for a request id
    pub fn cancel_request(id: i64) -> Self {
        Message::notification(CANCEL_METHOD, json!({ "id": id }))
    }

    // ------------------------------------------------------------------
    // Accessors: return explicit absence so callers can branch on presence
    // ------------------------------------------------------------------

    pub fn id(&self) -> Option<i64> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => Some(*id),
            Message::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Message::Request { params, .. } | Message::Notification { params, .. } => Some(params),
            Message::Response { .. } => None,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Message::Response { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match self {
            Message::Response { error, .. } => error.as_ref(),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Wire conversion
    // ------------------------------------------------------------------

    /// Encode as UTF-8 JSON, always injecting `jsonrpc: "2.0"`
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let envelope = match self {
            Message::Request { id, method, params } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "method": method,
                "params": params,
            }),
            Message::Notification { method, params } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": method,
                "params": params,
            }),
            Message::Response { id, result, error } => {
                let mut map = serde_json::Map::new();
                map.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
                map.insert("id".into(), json!(id));
                match error {
                    Some(error) => {
                        map.insert(
                            "error".into(),
                            serde_json::to_value(error)
                                .map_err(|e| MessageError::Encode(e.to_string()))?,
                        );
                    }
                    None => {
                        map.insert("result".into(), result.clone().unwrap_or(Value::Null));
                    }
                }
                Value::Object(map)
            }
        };

        serde_json::to_vec(&envelope).map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Decode UTF-8 JSON bytes into a message.
    ///
    /// Fails when the bytes are not a JSON object, when `jsonrpc` is
    /// missing or not `"2.0"`, or when the fields fit none of the three
    /// envelope shapes.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Invalid(e.to_string()))?;

        let Value::Object(mut map) = value else {
            return Err(MessageError::Invalid("message is not a JSON object".into()));
        };

        match map.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => return Err(MessageError::Version(other.to_string())),
            None => return Err(MessageError::Invalid("missing jsonrpc field".into())),
        }

        let id = match map.get("id") {
            None => None,
            Some(value) => Some(
                value
                    .as_i64()
                    .ok_or_else(|| MessageError::Invalid(format!("non-integer id: {value}")))?,
            ),
        };

        let method = match map.get("method") {
            None => None,
            Some(value) => Some(
                value
                    .as_str()
                    .ok_or_else(|| MessageError::Invalid(format!("non-string method: {value}")))?
                    .to_string(),
            ),
        };

        // `remove` keeps an explicit `"result": null` distinguishable from
        // an absent result
        let params = map.remove("params").unwrap_or(Value::Null);
        let result = map.remove("result");
        let error = map
            .remove("error")
            .map(serde_json::from_value::<ErrorObject>)
            .transpose()
            .map_err(|e| MessageError::Invalid(format!("malformed error object: {e}")))?;

        match (method, id) {
            (Some(method), Some(id)) => Ok(Message::Request { id, method, params }),
            (Some(method), None) => Ok(Message::Notification { method, params }),
            (None, Some(id)) => match (result, error) {
                (Some(_), Some(_)) => Err(MessageError::Invalid(
                    "response carries both result and error".into(),
                )),
                (None, None) => Err(MessageError::EmptyResponse),
                (result, error) => Ok(Message::Response { id, result, error }),
            },
            (None, None) => Err(MessageError::Invalid(
                "message carries neither method nor id".into(),
            )),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
