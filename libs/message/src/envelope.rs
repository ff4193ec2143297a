//! Message envelope - the common wrapper for everything on the wire.
//!
//! Wire shape:
//!
//! ```text
//! {"kind": "report", "meta": {"x-baetyl-request-id": "...", "sync": "true"}, "content": {...}}
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MessageError;

/// Correlation ID of a synchronous request.
pub const KEY_REQUEST_ID: &str = "x-baetyl-request-id";
/// Marks a message as part of a synchronous request/response exchange.
/// Any non-empty value counts.
pub const KEY_SYNC: &str = "sync";
/// Node name of the sender.
pub const KEY_NAME: &str = "name";
/// Node namespace of the sender.
pub const KEY_NAMESPACE: &str = "namespace";
/// Device a device-scoped message refers to.
pub const KEY_DEVICE: &str = "device";
/// Structured error code carried by error messages.
pub const KEY_ERROR_CODE: &str = "errorCode";

/// Message kind for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Report,
    Desire,
    Delta,
    NodeProps,
    DeviceReport,
    DeviceDesire,
    DeviceDelta,
    Error,
    /// Any kind this agent does not interpret.
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Report => "report",
            MessageKind::Desire => "desire",
            MessageKind::Delta => "delta",
            MessageKind::NodeProps => "nodeProps",
            MessageKind::DeviceReport => "deviceReport",
            MessageKind::DeviceDesire => "deviceDesire",
            MessageKind::DeviceDelta => "deviceDelta",
            MessageKind::Error => "error",
            MessageKind::Other(s) => s,
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "report" => MessageKind::Report,
            "desire" => MessageKind::Desire,
            "delta" => MessageKind::Delta,
            "nodeProps" => MessageKind::NodeProps,
            "deviceReport" => MessageKind::DeviceReport,
            "deviceDesire" => MessageKind::DeviceDesire,
            "deviceDelta" => MessageKind::DeviceDelta,
            "error" => MessageKind::Error,
            _ => MessageKind::Other(s),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON payload decoded on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Content(serde_json::Value);

impl Content {
    /// Wrap any serializable value.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, MessageError> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Decode into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Resolve `{{.NAME}}` placeholders in string values with `lookup`.
    /// Returns how many were replaced.
    pub fn expand_env<F>(&mut self, lookup: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        crate::env::expand_value(&mut self.0, &lookup)
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// A message exchanged with the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,

    #[serde(rename = "meta", default, deserialize_with = "nullable_map")]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub content: Content,
}

fn nullable_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    /// Create a message of `kind` with no metadata.
    pub fn new(kind: MessageKind, content: impl Into<Content>) -> Self {
        Self {
            kind,
            metadata: HashMap::new(),
            content: content.into(),
        }
    }

    /// Create a message whose content is `value` serialized.
    pub fn with_payload<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self, MessageError> {
        Ok(Self::new(kind, Content::encode(value)?))
    }

    /// Create an error message carrying `text`.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, serde_json::Value::String(text.into()))
    }

    /// Builder-style metadata setter.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Correlation ID, if this message belongs to a synchronous exchange.
    pub fn request_id(&self) -> Option<&str> {
        self.get_meta(KEY_REQUEST_ID)
    }

    /// Whether the sync flag is set to a non-empty value.
    pub fn is_sync(&self) -> bool {
        self.get_meta(KEY_SYNC).is_some_and(|v| !v.is_empty())
    }

    /// Decode the content, naming the message kind on failure.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        self.content
            .decode()
            .map_err(|e| MessageError::InvalidContent {
                kind: self.kind.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }
}
