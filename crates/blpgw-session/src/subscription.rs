//! Subscription handles.

use std::fmt;
use std::sync::Arc;

use blpgw_core::CorrelationId;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::SessionError;
use crate::names::service_for_security;
use crate::raw::SubscriptionRequest;

/// Delivered to a subscription's listener.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// One data message.
    Data {
        /// Event name the data arrived under.
        message_type: String,
        /// Payload.
        data: Value,
    },
    /// The subscription ended abnormally (session terminated).
    Error(SessionError),
}

type Listener = Box<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Where a subscription is in its lifecycle with one multiplexed session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Binding {
    /// Not tracked.
    Unbound,
    /// Id reserved; services are opening.
    Opening(CorrelationId),
    /// Routed and subscribed upstream.
    Active(CorrelationId),
}

/// One client subscription.
///
/// `correlation_id` is the client's own tag and is echoed back with data; the
/// upstream correlation id is assigned by the multiplexed session while the
/// subscription is tracked.
pub struct Subscription {
    /// Client-chosen id.
    pub correlation_id: u64,
    /// Security, optionally prefixed with a service URI.
    pub security: String,
    /// Requested fields.
    pub fields: Vec<String>,
    /// Upstream options.
    pub options: Option<Value>,
    listener: Listener,
    binding: Mutex<Binding>,
}

impl Subscription {
    /// Create a handle whose events go to `listener`.
    pub fn new(
        correlation_id: u64,
        security: impl Into<String>,
        fields: Vec<String>,
        options: Option<Value>,
        listener: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            correlation_id,
            security: security.into(),
            fields,
            options,
            listener: Box::new(listener),
            binding: Mutex::new(Binding::Unbound),
        })
    }

    /// Service URI this subscription targets.
    pub fn service(&self) -> &str {
        service_for_security(&self.security)
    }

    /// Upstream correlation id while subscribed.
    pub fn upstream_id(&self) -> Option<CorrelationId> {
        match *self.binding.lock() {
            Binding::Active(id) => Some(id),
            Binding::Unbound | Binding::Opening(_) => None,
        }
    }

    /// Whether a multiplexed session is tracking this subscription.
    pub fn is_tracked(&self) -> bool {
        !matches!(*self.binding.lock(), Binding::Unbound)
    }

    pub(crate) fn binding(&self) -> Binding {
        *self.binding.lock()
    }

    pub(crate) fn set_binding(&self, binding: Binding) {
        *self.binding.lock() = binding;
    }

    pub(crate) fn to_request(&self, id: CorrelationId) -> SubscriptionRequest {
        SubscriptionRequest {
            correlation_id: id,
            security: self.security.clone(),
            fields: self.fields.clone(),
            options: self.options.clone(),
        }
    }

    pub(crate) fn deliver(&self, event: SubscriptionEvent) {
        (self.listener)(event);
    }

    /// Deliver `event` only while routed under `id`.
    ///
    /// The binding lock is held through the listener call, so an unbind
    /// either waits for an in-flight delivery or makes it a no-op.
    pub(crate) fn deliver_if_bound(&self, id: CorrelationId, event: SubscriptionEvent) -> bool {
        let binding = self.binding.lock();
        if *binding != Binding::Active(id) {
            return false;
        }
        (self.listener)(event);
        true
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("correlation_id", &self.correlation_id)
            .field("security", &self.security)
            .field("fields", &self.fields)
            .field("options", &self.options)
            .field("binding", &self.binding())
            .finish_non_exhaustive()
    }
}
