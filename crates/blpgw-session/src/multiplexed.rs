//! Request/subscribe/unsubscribe over one raw session.
//!
//! A single dispatcher task drains the raw event channel and routes every
//! event through the [`CorrelationRegistry`] to exactly one handler:
//!
//! - **service routes** resolve or reject the shared open in [`ServiceCache`]
//! - **request routes** forward chunks into the caller's [`ResponseStream`]
//!   and are released by the final response
//! - **subscription routes** hand data to the subscription's listener
//!
//! Events with no route (late data for a released id) are dropped.
//! `SessionTerminated` fails everything outstanding once and leaves the
//! session permanently unusable.

use std::collections::BTreeSet;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use blpgw_core::{CorrelationId, CorrelationIdAllocator};
use futures::Stream;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, SessionError};
use crate::names::{events_for_service, response_name};
use crate::raw::{
    EventType, RawEvent, RawMessage, RawSession, SERVICE_OPEN_FAILURE, SERVICE_OPENED,
};
use crate::registry::CorrelationRegistry;
use crate::services::{Acquire, ServiceCache};
use crate::subscription::{Binding, Subscription, SubscriptionEvent};

/// One response message for a request.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseChunk {
    /// Message payload.
    pub data: Value,
    /// Whether this is the last chunk.
    pub is_final: bool,
}

/// Chunks of one request's response, in emission order.
///
/// Ends after the final chunk, or after a single `Err` if the session
/// terminates first.
#[derive(Debug)]
pub struct ResponseStream {
    id: CorrelationId,
    rx: mpsc::UnboundedReceiver<Result<ResponseChunk>>,
}

impl ResponseStream {
    /// Correlation id the request was issued with.
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    /// Next chunk, or `None` once the response is complete.
    pub async fn next_chunk(&mut self) -> Option<Result<ResponseChunk>> {
        self.rx.recv().await
    }
}

impl Stream for ResponseStream {
    type Item = Result<ResponseChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum Route {
    Service { uri: String },
    Request(mpsc::UnboundedSender<Result<ResponseChunk>>),
    Subscription(Arc<Subscription>),
}

struct Inner {
    registry: CorrelationRegistry<Route>,
    services: ServiceCache,
    terminated: bool,
}

impl Inner {
    fn check_live(&self) -> Result<()> {
        if self.terminated {
            return Err(SessionError::Terminated);
        }
        Ok(())
    }
}

struct Shared {
    inner: Mutex<Inner>,
    terminated: CancellationToken,
}

impl Shared {
    fn dispatch(&self, event: RawEvent) {
        let Some(id) = event.correlation_id() else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.terminated {
            return;
        }

        match event {
            RawEvent::ServiceOpened { .. } => {
                if let Some(uri) = take_service_route(&mut inner.registry, id) {
                    info!(%uri, %id, "service opened");
                    inner.services.resolve(&uri);
                } else {
                    drop_unrouted(SERVICE_OPENED, id);
                }
            }
            RawEvent::ServiceOpenFailure { reason, .. } => {
                if let Some(uri) = take_service_route(&mut inner.registry, id) {
                    warn!(%uri, %id, %reason, "service open failed");
                    let err = SessionError::ServiceOpenFailure {
                        uri: uri.clone(),
                        reason,
                    };
                    inner.services.reject(&uri, &err);
                } else {
                    drop_unrouted(SERVICE_OPEN_FAILURE, id);
                }
            }
            RawEvent::Message(RawMessage {
                message_type,
                event_type,
                data,
                ..
            }) => {
                let mut release = false;
                let mut target = None;
                match inner.registry.get(&message_type, id) {
                    Some(Route::Request(tx)) => {
                        let is_final = event_type == Some(EventType::Response);
                        let delivered = tx.send(Ok(ResponseChunk { data, is_final })).is_ok();
                        release = is_final || !delivered;
                    }
                    Some(Route::Subscription(sub)) => target = Some((Arc::clone(sub), data)),
                    Some(Route::Service { .. }) | None if inner.registry.contains_id(id) => {
                        debug!(%id, %message_type, "unexpected event for a live id, ignoring");
                    }
                    Some(Route::Service { .. }) | None => drop_unrouted(&message_type, id),
                }
                if release {
                    let _ = inner.registry.remove(&message_type, id);
                    debug!(%id, %message_type, "request complete");
                }
                drop(inner);
                if let Some((sub, data)) = target {
                    let event = SubscriptionEvent::Data {
                        message_type: message_type.clone(),
                        data,
                    };
                    // an unsubscribe may have released the id since the lookup
                    if !sub.deliver_if_bound(id, event) {
                        drop_unrouted(&message_type, id);
                    }
                }
            }
            RawEvent::SessionTerminated { .. } => {}
        }
    }

    fn terminate(&self, reason: &str) {
        let routes = {
            let mut inner = self.inner.lock();
            if inner.terminated {
                return;
            }
            inner.terminated = true;
            inner.services.fail_all(&SessionError::Terminated);
            inner.registry.drain()
        };
        self.terminated.cancel();
        warn!(reason, outstanding = routes.len(), "session terminated");

        let mut notified = BTreeSet::new();
        for (id, route) in routes {
            match route {
                Route::Request(tx) => {
                    let _ = tx.send(Err(SessionError::Terminated));
                }
                Route::Subscription(sub) => {
                    if notified.insert(id) {
                        sub.set_binding(Binding::Unbound);
                        sub.deliver(SubscriptionEvent::Error(SessionError::Terminated));
                    }
                }
                Route::Service { .. } => {}
            }
        }
    }
}

fn take_service_route(
    registry: &mut CorrelationRegistry<Route>,
    id: CorrelationId,
) -> Option<String> {
    let mut uri = None;
    for route in registry.remove_id(id) {
        if let Route::Service { uri: u } = route {
            uri = Some(u);
        }
    }
    uri
}

fn drop_unrouted(event: &str, id: CorrelationId) {
    metrics::counter!("blpgw_upstream_events_dropped_total").increment(1);
    debug!(event, %id, "no route for event, dropping");
}

async fn dispatch_loop(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<RawEvent>) {
    while let Some(event) = events.recv().await {
        metrics::counter!("blpgw_upstream_events_total").increment(1);
        if let RawEvent::SessionTerminated { reason } = &event {
            shared.terminate(reason);
            return;
        }
        shared.dispatch(event);
    }
    shared.terminate("event stream closed");
}

/// Releases a batch's reserved ids unless the batch reached the upstream.
struct BatchClaim<'a> {
    subscriptions: &'a [Arc<Subscription>],
    ids: Vec<CorrelationId>,
    armed: bool,
}

impl BatchClaim<'_> {
    fn commit(mut self) {
        for (sub, id) in self.subscriptions.iter().zip(&self.ids) {
            sub.set_binding(Binding::Active(*id));
        }
        self.armed = false;
    }
}

impl Drop for BatchClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            for sub in self.subscriptions {
                sub.set_binding(Binding::Unbound);
            }
        }
    }
}

/// Many independent requests and subscriptions over one raw session.
pub struct MultiplexedSession {
    raw: Arc<dyn RawSession>,
    shared: Arc<Shared>,
    ids: CorrelationIdAllocator,
    dispatcher: JoinHandle<()>,
}

impl fmt::Debug for MultiplexedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedSession")
            .field("terminated", &self.is_terminated())
            .field("routes", &self.route_count())
            .field("allocated_ids", &self.ids.allocated())
            .finish_non_exhaustive()
    }
}

impl MultiplexedSession {
    /// Wrap `raw`, whose events arrive on `events`. Must be called inside a
    /// Tokio runtime; the dispatcher task lives as long as the session.
    pub fn new(raw: Arc<dyn RawSession>, events: mpsc::UnboundedReceiver<RawEvent>) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                registry: CorrelationRegistry::new(),
                services: ServiceCache::new(),
                terminated: false,
            }),
            terminated: CancellationToken::new(),
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), events));
        Self {
            raw,
            shared,
            ids: CorrelationIdAllocator::new(),
            dispatcher,
        }
    }

    /// Start the raw session.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<()> {
        self.shared.inner.lock().check_live()?;
        self.raw.start().await.map_err(|err| match err {
            SessionError::StartFailure(_) => err,
            other => SessionError::StartFailure(other.to_string()),
        })?;
        info!("session started");
        Ok(())
    }

    /// Stop the raw session. Outstanding work fails with `Terminated`.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> Result<()> {
        if self.is_terminated() {
            return Ok(());
        }
        {
            let inner = self.shared.inner.lock();
            if !inner.registry.is_empty() {
                info!(outstanding = inner.registry.len(), "stopping with outstanding routes");
            }
        }
        let result = self.raw.stop().await;
        self.shared.terminate("session stopped");
        result
    }

    /// Whether the session has terminated.
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.is_cancelled()
    }

    /// Resolves once the session terminates.
    pub async fn terminated(&self) {
        self.shared.terminated.cancelled().await;
    }

    /// Token cancelled when the session terminates.
    pub fn termination_token(&self) -> CancellationToken {
        self.shared.terminated.child_token()
    }

    /// Number of live routes (service opens, requests, subscription events).
    pub fn route_count(&self) -> usize {
        self.shared.inner.lock().registry.len()
    }

    /// Issue `name` against `uri` and stream its response.
    ///
    /// A failed service open fails the request without issuing it.
    #[instrument(skip(self, payload))]
    pub async fn request(&self, uri: &str, name: &str, payload: Value) -> Result<ResponseStream> {
        self.shared.inner.lock().check_live()?;
        let id = self.ids.next_id();
        self.open_service(uri).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let response = response_name(name);
        {
            let mut inner = self.shared.inner.lock();
            inner.check_live()?;
            let registered = inner.registry.register(&response, id, Route::Request(tx));
            debug_assert!(registered, "correlation ids are never reused");
            if let Err(err) = self.raw.request(uri, name, payload, id) {
                let _ = inner.registry.remove(&response, id);
                return Err(err);
            }
        }
        metrics::counter!("blpgw_upstream_requests_total").increment(1);
        debug!(%id, %response, "request issued");
        Ok(ResponseStream { id, rx })
    }

    /// Subscribe a batch.
    ///
    /// Fails up front if any subscription is already tracked. Opens every
    /// distinct service in parallel, then issues one upstream subscribe. On
    /// any failure (or if the returned future is dropped) no part of the
    /// batch stays registered.
    #[instrument(skip_all, fields(count = subscriptions.len()))]
    pub async fn subscribe(&self, subscriptions: &[Arc<Subscription>]) -> Result<()> {
        let claim = self.claim(subscriptions)?;

        let uris: BTreeSet<&str> = subscriptions.iter().map(|sub| sub.service()).collect();
        if let Err(err) = try_join_all(uris.iter().map(|uri| self.open_service(uri))).await {
            warn!(error = %err, "subscribe failed while opening services");
            return Err(err);
        }

        let mut inner = self.shared.inner.lock();
        inner.check_live()?;
        let mut requests = Vec::with_capacity(subscriptions.len());
        for (sub, id) in subscriptions.iter().zip(&claim.ids) {
            for event in events_for_service(sub.service()) {
                let _ = inner
                    .registry
                    .register(event, *id, Route::Subscription(Arc::clone(sub)));
            }
            requests.push(sub.to_request(*id));
        }
        if let Err(err) = self.raw.subscribe(&requests) {
            for id in &claim.ids {
                let _ = inner.registry.remove_id(*id);
            }
            return Err(err);
        }
        claim.commit();
        drop(inner);

        metrics::counter!("blpgw_upstream_subscriptions_total").increment(requests.len() as u64);
        debug!(ids = ?requests.iter().map(|r| r.correlation_id).collect::<Vec<_>>(), "subscribed");
        Ok(())
    }

    /// Unsubscribe a batch. Listeners are released before returning; late
    /// events for these ids are dropped.
    #[instrument(skip_all, fields(count = subscriptions.len()))]
    pub fn unsubscribe(&self, subscriptions: &[Arc<Subscription>]) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        inner.check_live()?;

        let mut ids = Vec::with_capacity(subscriptions.len());
        for (index, sub) in subscriptions.iter().enumerate() {
            let repeated = subscriptions[..index].iter().any(|other| Arc::ptr_eq(other, sub));
            match sub.binding() {
                Binding::Active(id) if !repeated => ids.push(id),
                _ => return Err(SessionError::UnknownSubscription { index }),
            }
        }
        for (sub, id) in subscriptions.iter().zip(&ids) {
            let _ = inner.registry.remove_id(*id);
            sub.set_binding(Binding::Unbound);
        }
        debug!(?ids, "unsubscribed");
        self.raw.unsubscribe(&ids)
    }

    fn claim<'a>(&self, subscriptions: &'a [Arc<Subscription>]) -> Result<BatchClaim<'a>> {
        let inner = self.shared.inner.lock();
        inner.check_live()?;
        for (index, sub) in subscriptions.iter().enumerate() {
            let repeated = subscriptions[..index].iter().any(|other| Arc::ptr_eq(other, sub));
            if repeated || sub.is_tracked() {
                return Err(SessionError::DuplicateSubscription { index });
            }
        }
        let ids = subscriptions
            .iter()
            .map(|sub| {
                let id = self.ids.next_id();
                sub.set_binding(Binding::Opening(id));
                id
            })
            .collect();
        drop(inner);
        Ok(BatchClaim {
            subscriptions,
            ids,
            armed: true,
        })
    }

    async fn open_service(&self, uri: &str) -> Result<()> {
        let waiter = {
            let mut inner = self.shared.inner.lock();
            inner.check_live()?;
            match inner.services.acquire(uri, || self.ids.next_id()) {
                Acquire::Ready => return Ok(()),
                Acquire::Wait(waiter) => waiter,
                Acquire::Start { id, waiter } => {
                    debug!(uri, %id, "opening service");
                    for event in [SERVICE_OPENED, SERVICE_OPEN_FAILURE] {
                        let _ = inner.registry.register(
                            event,
                            id,
                            Route::Service {
                                uri: uri.to_string(),
                            },
                        );
                    }
                    if let Err(err) = self.raw.open_service(uri, id) {
                        let _ = inner.registry.remove_id(id);
                        inner.services.reject(uri, &err);
                    }
                    waiter
                }
            }
        };
        waiter.await.unwrap_or(Err(SessionError::Terminated))
    }
}

impl Drop for MultiplexedSession {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
