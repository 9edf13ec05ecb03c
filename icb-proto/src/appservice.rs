//! Matrix application-service transaction types.
//!
//! A home server pushes batches of room events to the bridge as
//! [`TransactionBatch`] JSON bodies. Only the fields the bridge reads are
//! modelled; everything else in an event is ignored.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Event types carrying a chat message.
///
/// `m.room.message` is the Matrix type; the bare `room.message` form is
/// accepted too.
pub const MESSAGE_EVENT_TYPES: [&str; 2] = ["m.room.message", "room.message"];

/// A batch of events pushed by the home server in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransactionBatch {
    /// Events in the order the home server sent them.
    #[serde(default)]
    pub events: Vec<BridgeEvent>,
}

/// One room event from a transaction.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeEvent {
    /// Event identifier.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub event_id: String,
    /// Event type, e.g. `m.room.message`.
    #[serde(rename = "type", default, deserialize_with = "null_as_empty")]
    pub event_type: String,
    /// Room the event was sent in.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub room_id: String,
    /// Legacy sender field.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Current sender field.
    #[serde(default)]
    pub sender: Option<String>,
    /// Free-form event content.
    #[serde(default)]
    pub content: Value,
}

/// Reads an optional string, treating `null` like a missing key.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Why a message body could not be extracted from an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    /// The content has no `body` key.
    #[error("event content has no body")]
    MissingBody,
    /// The `body` value is not a string.
    #[error("event body is not a string")]
    BodyNotString,
}

impl BridgeEvent {
    /// The sending user's ID, preferring `user_id` over `sender`.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.sender.as_deref())
            .unwrap_or_default()
    }

    /// Whether this event carries a chat message.
    #[must_use]
    pub fn is_message(&self) -> bool {
        MESSAGE_EVENT_TYPES.contains(&self.event_type.as_str())
    }

    /// The message text in `content.body`.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError`] when the body is absent or not a string.
    pub fn body(&self) -> Result<&str, ContentError> {
        match self.content.get("body") {
            Some(Value::String(body)) => Ok(body.as_str()),
            Some(_) => Err(ContentError::BodyNotString),
            None => Err(ContentError::MissingBody),
        }
    }
}
