//! Envelope codec for server-pushed real-time messages.
//!
//! Wire format (JSON text frame):
//! ```text
//! {
//!   "type":      "balance_update",          required, string
//!   "data":      { ... },                   required, non-null
//!   "user_id":   42,                        optional, integer ("userId" accepted)
//!   "timestamp": "2024-05-01T12:00:00Z"     optional, ISO-8601 string
//! }
//! ```
//!
//! Parsing is pure: a malformed frame yields a [`CodecError`], never a panic,
//! so the connection manager can log it and keep the socket open.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Known message type keys.
pub mod message_types {
    pub const BALANCE_UPDATE: &str = "balance_update";
    pub const PURCHASE_APPROVAL_NOTIFICATION: &str = "purchase_approval_notification";
    pub const TRANSACTION_UPDATE: &str = "transaction_update";
    pub const FRAUD_ALERT: &str = "fraud_alert";
    pub const WEBHOOK_STATUS: &str = "webhook_status";
}

/// Envelope decoding failures.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has an unexpected type")]
    InvalidField(&'static str),
}

/// Typed view of the envelope `type` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    BalanceUpdate,
    PurchaseApprovalNotification,
    TransactionUpdate,
    FraudAlert,
    WebhookStatus,
    /// Any type this crate has no name for
    Other(String),
}

impl MessageKind {
    pub fn from_type(message_type: &str) -> Self {
        match message_type {
            message_types::BALANCE_UPDATE => Self::BalanceUpdate,
            message_types::PURCHASE_APPROVAL_NOTIFICATION => Self::PurchaseApprovalNotification,
            message_types::TRANSACTION_UPDATE => Self::TransactionUpdate,
            message_types::FRAUD_ALERT => Self::FraudAlert,
            message_types::WEBHOOK_STATUS => Self::WebhookStatus,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::BalanceUpdate => message_types::BALANCE_UPDATE,
            Self::PurchaseApprovalNotification => message_types::PURCHASE_APPROVAL_NOTIFICATION,
            Self::TransactionUpdate => message_types::TRANSACTION_UPDATE,
            Self::FraudAlert => message_types::FRAUD_ALERT,
            Self::WebhookStatus => message_types::WEBHOOK_STATUS,
            Self::Other(name) => name,
        }
    }
}

/// One parsed inbound message.
///
/// Immutable once parsed; the manager shares it as `Arc<MessageEnvelope>`
/// between the last-message slot and every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl MessageEnvelope {
    /// Build an envelope without timestamp or user.
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: None,
            user_id: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_type(&self.message_type)
    }

    /// Decode `data` into a caller-defined payload type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one text frame into an envelope.
pub fn parse(raw: &str) -> Result<MessageEnvelope, CodecError> {
    let value: Value = serde_json::from_str(raw)?;
    let mut fields = match value {
        Value::Object(fields) => fields,
        other => return Err(CodecError::NotAnObject(json_kind(&other))),
    };

    let message_type = match fields.remove("type") {
        Some(Value::String(name)) if !name.is_empty() => name,
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err(CodecError::MissingField("type"))
        }
        Some(_) => return Err(CodecError::InvalidField("type")),
    };

    let data = match fields.remove("data") {
        Some(Value::Null) | None => return Err(CodecError::MissingField("data")),
        Some(data) => data,
    };

    let timestamp = match fields.remove("timestamp") {
        Some(Value::String(ts)) => Some(ts),
        Some(Value::Null) | None => None,
        Some(_) => return Err(CodecError::InvalidField("timestamp")),
    };

    Ok(MessageEnvelope {
        message_type,
        data,
        timestamp,
        user_id: user_id(&mut fields)?,
    })
}

fn user_id(fields: &mut Map<String, Value>) -> Result<Option<i64>, CodecError> {
    let raw = match fields.remove("user_id") {
        Some(value) => Some(value),
        None => fields.remove("userId"),
    };
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or(CodecError::InvalidField("user_id")),
        Some(_) => Err(CodecError::InvalidField("user_id")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
