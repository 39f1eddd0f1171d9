//! Message envelope and wire codec
//!
//! Every message exchanged over the broker is a JSON object:
//!
//! ```json
//! { "type": "OCR_COMPLETED", "data": { "file_path": "..." }, "reply_to": "events" }
//! ```
//!
//! `decode` is strict about the envelope shape and lenient about `data`
//! contents; field-level checks belong to the router. `encode` cannot fail
//! because an [`Envelope`] can only be constructed in a valid state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::messages::Payload;

/// Envelope codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes are not a well-formed envelope; never retryable
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Attempt to build an envelope that could not be decoded again
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// `data` does not match the payload expected for the message type
    #[error("Invalid {message_type} payload: {reason}")]
    Payload {
        message_type: String,
        reason: String,
    },
}

/// A unit of work passed between stages
///
/// Envelopes are immutable once built; forwarding work means building a new
/// envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    message_type: String,
    data: Map<String, Value>,
    reply_to: Option<String>,
}

impl Envelope {
    /// Build an envelope from a type and a raw data map
    pub fn new(message_type: impl Into<String>, data: Map<String, Value>) -> Result<Self, CodecError> {
        let message_type = message_type.into();
        if message_type.trim().is_empty() {
            return Err(CodecError::InvalidEnvelope(
                "message type must not be empty".to_string(),
            ));
        }
        Ok(Self {
            message_type,
            data,
            reply_to: None,
        })
    }

    /// Build an envelope from a typed payload
    pub fn from_payload<P: Payload>(payload: &P) -> Result<Self, CodecError> {
        match serde_json::to_value(payload) {
            Ok(Value::Object(data)) => Self::new(P::MESSAGE_TYPE, data),
            Ok(other) => Err(CodecError::InvalidEnvelope(format!(
                "{} payload serialized to {} instead of an object",
                P::MESSAGE_TYPE,
                json_kind(&other)
            ))),
            Err(e) => Err(CodecError::InvalidEnvelope(e.to_string())),
        }
    }

    /// Return a copy of this envelope that asks for replies on `queue`
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// String value of a data field, if present and a string
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    /// Names from `required` that are absent or null in `data`
    pub fn missing_fields<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|field| matches!(self.data.get(*field), None | Some(Value::Null)))
            .collect()
    }

    /// Deserialize `data` into the payload type `T`
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| CodecError::Payload {
            message_type: self.message_type.clone(),
            reason: e.to_string(),
        })
    }

    /// JSON form of the whole envelope
    pub fn to_json_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(self.message_type.clone()));
        object.insert("data".to_string(), Value::Object(self.data.clone()));
        if let Some(reply_to) = &self.reply_to {
            object.insert("reply_to".to_string(), Value::String(reply_to.clone()));
        }
        Value::Object(object)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_json_value().to_string().into_bytes()
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

/// Serialize an envelope to wire bytes
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.encode()
}

/// Parse wire bytes into an envelope
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::Malformed(format!("invalid JSON: {}", e)))?;

    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(CodecError::Malformed(format!(
                "envelope must be a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let message_type = match object.remove("type") {
        Some(Value::String(t)) if !t.trim().is_empty() => t,
        Some(Value::String(_)) => {
            return Err(CodecError::Malformed("message type is empty".to_string()))
        }
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "message type must be a string, got {}",
                json_kind(&other)
            )))
        }
        None => return Err(CodecError::Malformed("missing message type".to_string())),
    };

    let data = match object.remove("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(data)) => data,
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "data must be an object, got {}",
                json_kind(&other)
            )))
        }
    };

    let reply_to = match object.remove("reply_to") {
        None | Some(Value::Null) => None,
        Some(Value::String(queue)) => Some(queue),
        Some(other) => {
            return Err(CodecError::Malformed(format!(
                "reply_to must be a string, got {}",
                json_kind(&other)
            )))
        }
    };

    Ok(Envelope {
        message_type,
        data,
        reply_to,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
