//! The raw session capability.
//!
//! A raw session is a single event stream shared by every request and
//! subscription; each event carries the correlation id of the operation it
//! belongs to. Operations are fire-and-forget: their outcome arrives later as
//! an event on the channel handed out when the session was created.

use async_trait::async_trait;
use blpgw_core::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// Event name emitted when a service opens.
pub const SERVICE_OPENED: &str = "ServiceOpened";
/// Event name emitted when a service fails to open.
pub const SERVICE_OPEN_FAILURE: &str = "ServiceOpenFailure";

/// Whether a response message is the last one for its correlation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// More messages follow.
    PartialResponse,
    /// Terminal message.
    Response,
}

/// One data-bearing message from the upstream.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMessage {
    /// Correlation id of the originating request or subscription.
    pub correlation_id: CorrelationId,
    /// Event name (`HistoricalDataResponse`, `MarketDataEvents`, ...).
    pub message_type: String,
    /// Partial/final marker for response messages; `None` for subscription data.
    pub event_type: Option<EventType>,
    /// Message payload.
    pub data: Value,
}

/// Everything the raw session can emit.
#[derive(Clone, Debug, PartialEq)]
pub enum RawEvent {
    /// A service opened by `open_service` is ready.
    ServiceOpened {
        /// Id passed to `open_service`.
        correlation_id: CorrelationId,
    },
    /// A service could not be opened.
    ServiceOpenFailure {
        /// Id passed to `open_service`.
        correlation_id: CorrelationId,
        /// Upstream description of the failure.
        reason: String,
    },
    /// Response or subscription data.
    Message(RawMessage),
    /// The session is gone. Emitted at most once.
    SessionTerminated {
        /// Upstream description.
        reason: String,
    },
}

impl RawEvent {
    /// Event name used to route this event.
    pub fn name(&self) -> &str {
        match self {
            Self::ServiceOpened { .. } => SERVICE_OPENED,
            Self::ServiceOpenFailure { .. } => SERVICE_OPEN_FAILURE,
            Self::Message(m) => &m.message_type,
            Self::SessionTerminated { .. } => "SessionTerminated",
        }
    }

    /// Correlation id carried by this event, if any.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::ServiceOpened { correlation_id }
            | Self::ServiceOpenFailure { correlation_id, .. } => Some(*correlation_id),
            Self::Message(m) => Some(m.correlation_id),
            Self::SessionTerminated { .. } => None,
        }
    }
}

/// One entry of a batched subscribe call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubscriptionRequest {
    /// Id the upstream tags this subscription's data with.
    pub correlation_id: CorrelationId,
    /// Security (optionally prefixed with a service URI).
    pub security: String,
    /// Requested fields.
    pub fields: Vec<String>,
    /// Upstream subscription options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// The upstream session capability wrapped by `MultiplexedSession`.
///
/// Implementations deliver outcomes as [`RawEvent`]s on their event channel;
/// the synchronous methods only report failures to issue the call.
#[async_trait]
pub trait RawSession: Send + Sync + 'static {
    /// Connect and wait until the session is usable.
    async fn start(&self) -> Result<()>;

    /// Disconnect. A `SessionTerminated` event follows.
    async fn stop(&self) -> Result<()>;

    /// Begin opening `uri`; `ServiceOpened`/`ServiceOpenFailure` carries `id`.
    fn open_service(&self, uri: &str, id: CorrelationId) -> Result<()>;

    /// Issue `name` against the opened service `uri`; responses carry `id`.
    fn request(&self, uri: &str, name: &str, payload: Value, id: CorrelationId) -> Result<()>;

    /// Subscribe a batch; data for each entry carries its correlation id.
    fn subscribe(&self, subscriptions: &[SubscriptionRequest]) -> Result<()>;

    /// Cancel subscriptions by correlation id.
    fn unsubscribe(&self, ids: &[CorrelationId]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        let id = CorrelationId::new(3);
        assert_eq!(RawEvent::ServiceOpened { correlation_id: id }.name(), "ServiceOpened");
        let msg = RawEvent::Message(RawMessage {
            correlation_id: id,
            message_type: "MarketDataEvents".into(),
            event_type: None,
            data: Value::Null,
        });
        assert_eq!(msg.name(), "MarketDataEvents");
        assert_eq!(msg.correlation_id(), Some(id));
    }

    #[test]
    fn terminated_has_no_correlation_id() {
        let ev = RawEvent::SessionTerminated { reason: "bye".into() };
        assert_eq!(ev.correlation_id(), None);
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::PartialResponse).unwrap(),
            "\"PARTIAL_RESPONSE\""
        );
        assert_eq!(serde_json::to_string(&EventType::Response).unwrap(), "\"RESPONSE\"");
    }

    #[test]
    fn subscription_request_omits_absent_options() {
        let req = SubscriptionRequest {
            correlation_id: CorrelationId::new(1),
            security: "IBM US Equity".into(),
            fields: vec!["LAST_PRICE".into()],
            options: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("options").is_none());
        assert_eq!(json["correlation_id"], 1);
    }
}
