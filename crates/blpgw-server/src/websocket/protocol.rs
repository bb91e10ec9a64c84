//! WebSocket message shapes.
//!
//! Client frames are `{"type": "...", "data": ...}` envelopes. Server frames
//! use the same envelope, with `data` omitted for bare acknowledgements.

use blpgw_longpoll::SubscriptionSpec;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A parsed client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientCommand {
    /// Subscribe to the entries in `data`.
    Subscribe(Option<Value>),
    /// Unsubscribe the ids in `data`, or everything when absent.
    Unsubscribe(Option<Value>),
    /// Any other type. Ignored.
    Other(String),
}

/// Errors reported to a WebSocket client as `err` frames.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WsError {
    /// The frame is not JSON.
    #[error("Invalid message received.")]
    InvalidMessage,
    /// The frame has no string `type`.
    #[error("Invalid message type received.")]
    InvalidMessageType,
    /// Subscribe with no entries.
    #[error("No valid subscriptions found.")]
    NoValidSubscriptions,
    /// A subscribe entry is malformed.
    #[error("Invalid subscription option.")]
    InvalidSubscriptionOption,
    /// A subscribe entry reuses a correlation id.
    #[error("Correlation Id already exists.")]
    DuplicateCorrelationId,
    /// Unsubscribe with nothing subscribed.
    #[error("No active subscriptions.")]
    NoActiveSubscriptions,
    /// Unsubscribe naming no subscribed id.
    #[error("No valid correlation Id.")]
    NoValidCorrelationId,
}

/// Frames sent to the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Sent once after the upgrade.
    #[serde(rename = "connected")]
    Connected,
    /// A subscribe batch is live.
    #[serde(rename = "subscribed")]
    Subscribed,
    /// Some subscriptions were removed; others remain.
    #[serde(rename = "unsubscribed")]
    Unsubscribed,
    /// The last subscription was removed.
    #[serde(rename = "unsubscribed all")]
    UnsubscribedAll,
    /// One tick.
    #[serde(rename = "data")]
    Data {
        /// Client id of the subscription.
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        /// Tick payload.
        data: Value,
    },
    /// A failed command or a fatal condition.
    #[serde(rename = "err")]
    Err {
        /// Human readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// `err` frame carrying `err`'s message.
    pub fn error(err: &impl std::fmt::Display) -> Self {
        Self::Err {
            message: err.to_string(),
        }
    }
}

/// Parse one text frame.
pub fn parse_command(text: &str) -> Result<ClientCommand, WsError> {
    let mut frame: Value = serde_json::from_str(text).map_err(|_| WsError::InvalidMessage)?;
    let kind = frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or(WsError::InvalidMessageType)?
        .to_owned();
    let data = frame
        .as_object_mut()
        .and_then(|obj| obj.remove("data"))
        .filter(|data| !data.is_null());
    Ok(match kind.as_str() {
        "subscribe" => ClientCommand::Subscribe(data),
        "unsubscribe" => ClientCommand::Unsubscribe(data),
        _ => ClientCommand::Other(kind),
    })
}

/// Entries of a subscribe frame. Every entry must be well formed.
pub fn parse_subscriptions(data: Option<Value>) -> Result<Vec<SubscriptionSpec>, WsError> {
    let Some(Value::Array(items)) = data else {
        return Err(WsError::NoValidSubscriptions);
    };
    if items.is_empty() {
        return Err(WsError::NoValidSubscriptions);
    }
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|_| WsError::InvalidSubscriptionOption))
        .collect()
}

/// Ids of an unsubscribe frame. `None` means every subscription; ids that are
/// not unsigned integers are skipped.
pub fn parse_unsubscribe(data: Option<&Value>) -> Option<Vec<u64>> {
    let ids = data?.get("correlationIds")?.as_array()?;
    if ids.is_empty() {
        return None;
    }
    Some(ids.iter().filter_map(Value::as_u64).collect())
}
