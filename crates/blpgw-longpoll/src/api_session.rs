//! Per-client long-poll state.
//!
//! An [`ApiSession`] owns one client's subscriptions, each with its own
//! [`HistoricalBufferManager`], plus the poll sequencing state. The freshness
//! store evicts it through [`Expirable`], which refuses while any
//! [`InUseGuard`] is alive.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use blpgw_core::ClientKey;
use blpgw_session::{MultiplexedSession, Subscription, SubscriptionEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::buffer::{BufferedData, HistoricalBufferManager};
use crate::errors::ApiSessionError;
use crate::freshness::Expirable;
use crate::poll::{PollDecision, PollState, validate_poll_id};

/// One entry of a subscribe request body.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Client-chosen id, unique per client.
    pub correlation_id: u64,
    /// Security, optionally prefixed with a service URI.
    pub security: String,
    /// Requested fields.
    pub fields: Vec<String>,
    /// Upstream options.
    #[serde(default)]
    pub options: Option<Value>,
}

impl SubscriptionSpec {
    /// Parse a non-empty JSON array of subscription entries. Every entry must
    /// be well formed for any to be accepted.
    pub fn parse_batch(body: Value) -> Result<Vec<Self>, ApiSessionError> {
        let Value::Array(items) = body else {
            return Err(ApiSessionError::InvalidBody(
                "expected an array of subscriptions".into(),
            ));
        };
        if items.is_empty() {
            return Err(ApiSessionError::InvalidBody("empty subscription list".into()));
        }
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|err| ApiSessionError::InvalidBody(err.to_string()))
            })
            .collect()
    }
}

/// Buffered data for one subscription, as returned to the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PolledPage {
    /// Client correlation id.
    #[serde(rename = "correlationId")]
    pub correlation_id: u64,
    /// Ticks in arrival order.
    pub data: Vec<Value>,
    /// Ticks dropped because the buffer was full.
    pub missed_ticks: u64,
}

impl PolledPage {
    fn new(correlation_id: u64, buffered: BufferedData<Value>) -> Self {
        Self {
            correlation_id,
            data: buffered.buffer,
            missed_ticks: buffered.overflow,
        }
    }
}

type SharedBuffer = Arc<Mutex<HistoricalBufferManager<Value>>>;

struct Tracked {
    sub: Arc<Subscription>,
    buffer: SharedBuffer,
    active: bool,
}

#[derive(Default)]
struct SessionState {
    poll: PollState,
    /// Every subscription received, keyed by client correlation id. The
    /// active ones are those whose upstream subscribe completed.
    received: BTreeMap<u64, Tracked>,
    upstream: Option<Arc<MultiplexedSession>>,
}

impl SessionState {
    fn active(&self) -> impl Iterator<Item = (&u64, &Tracked)> {
        self.received.iter().filter(|(_, t)| t.active)
    }

    fn reset(&mut self) {
        self.received.clear();
        self.poll = PollState::default();
        self.upstream = None;
    }
}

/// Server-side state for one client identity.
pub struct ApiSession {
    key: ClientKey,
    history_depth: usize,
    capacity: usize,
    in_use: AtomicUsize,
    expired: AtomicBool,
    state: Mutex<SessionState>,
    data_ready: Arc<Notify>,
}

impl ApiSession {
    /// New session whose subscriptions buffer `capacity` ticks over
    /// `history_depth` levels.
    ///
    /// # Panics
    ///
    /// If `history_depth < 2`; re-sending the previous page reads level 1.
    pub fn new(key: ClientKey, history_depth: usize, capacity: usize) -> Arc<Self> {
        assert!(
            history_depth >= 2,
            "invalid history depth {history_depth} for long-poll sessions"
        );
        Arc::new(Self {
            key,
            history_depth,
            capacity,
            in_use: AtomicUsize::new(0),
            expired: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
            data_ready: Arc::new(Notify::new()),
        })
    }

    /// Client identity.
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    /// Mark the session busy until the guard drops.
    pub fn acquire(self: &Arc<Self>) -> InUseGuard {
        let _ = self.in_use.fetch_add(1, Ordering::SeqCst);
        InUseGuard {
            session: Arc::clone(self),
        }
    }

    /// Outstanding [`InUseGuard`]s.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Whether the session has been evicted.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Subscriptions received, including ones still being subscribed.
    pub fn subscription_count(&self) -> usize {
        let mut state = self.state.lock();
        self.sync_with_upstream(&mut state);
        state.received.len()
    }

    /// Current poll sequencing state.
    pub fn poll_state(&self) -> PollState {
        self.state.lock().poll
    }

    /// Subscribe a batch on `mux`.
    ///
    /// The first batch binds the session to `mux` until everything is
    /// unsubscribed or that upstream terminates. Correlation ids must be new
    /// to this client. On failure nothing from the batch is kept.
    #[instrument(skip_all, fields(client = %self.key, count = specs.len()))]
    pub async fn subscribe(
        &self,
        mux: Arc<MultiplexedSession>,
        specs: Vec<SubscriptionSpec>,
    ) -> Result<(), ApiSessionError> {
        if specs.is_empty() {
            return Err(ApiSessionError::InvalidBody("empty subscription list".into()));
        }
        let (mux, subs) = {
            let mut state = self.state.lock();
            self.sync_with_upstream(&mut state);
            if self.is_expired() {
                return Err(ApiSessionError::Expired);
            }
            for (index, spec) in specs.iter().enumerate() {
                let cid = spec.correlation_id;
                if state.received.contains_key(&cid)
                    || specs[..index].iter().any(|s| s.correlation_id == cid)
                {
                    debug!(correlation_id = cid, "duplicate correlation id");
                    return Err(ApiSessionError::DuplicateCorrelationId(cid));
                }
            }
            let mux = Arc::clone(state.upstream.get_or_insert(mux));
            let subs: Vec<Arc<Subscription>> = specs
                .into_iter()
                .map(|spec| {
                    let buffer: SharedBuffer = Arc::new(Mutex::new(HistoricalBufferManager::new(
                        self.history_depth,
                        self.capacity,
                    )));
                    let cid = spec.correlation_id;
                    let sub = Subscription::new(
                        cid,
                        spec.security,
                        spec.fields,
                        spec.options,
                        buffering_listener(
                            self.key.clone(),
                            cid,
                            Arc::clone(&buffer),
                            Arc::clone(&self.data_ready),
                        ),
                    );
                    let _ = state.received.insert(
                        cid,
                        Tracked {
                            sub: Arc::clone(&sub),
                            buffer,
                            active: false,
                        },
                    );
                    sub
                })
                .collect();
            (mux, subs)
        };

        let pending = PendingBatch {
            session: self,
            subs: &subs,
            armed: true,
        };
        mux.subscribe(&subs).await?;

        let mut state = self.state.lock();
        if self.is_expired() {
            drop(state);
            if let Err(err) = mux.unsubscribe(&subs) {
                warn!(error = %err, "unsubscribe after expiry failed");
            }
            return Err(ApiSessionError::Expired);
        }
        for sub in &subs {
            if let Some(tracked) = state.received.get_mut(&sub.correlation_id) {
                tracked.active = true;
            }
        }
        drop(state);
        pending.commit();

        metrics::counter!("blpgw_client_subscriptions_total").increment(subs.len() as u64);
        debug!("subscribed");
        Ok(())
    }

    /// Unsubscribe `ids`, or every active subscription when `None`.
    ///
    /// Returns each removed subscription's undelivered data. Removing the
    /// last subscription resets the poll ids.
    #[instrument(skip_all, fields(client = %self.key))]
    pub fn unsubscribe(&self, ids: Option<Vec<u64>>) -> Result<Vec<PolledPage>, ApiSessionError> {
        let mut state = self.state.lock();
        self.sync_with_upstream(&mut state);

        let active: Vec<u64> = state.active().map(|(cid, _)| *cid).collect();
        if active.is_empty() {
            return Err(ApiSessionError::NoActiveSubscriptions);
        }
        let targets = match ids {
            None => active,
            Some(ids) => {
                if ids.is_empty() {
                    return Err(ApiSessionError::InvalidUnsubscribe);
                }
                let mut unique = Vec::with_capacity(ids.len());
                for cid in ids {
                    if unique.contains(&cid) {
                        continue;
                    }
                    if !active.contains(&cid) {
                        debug!(correlation_id = cid, "unknown correlation id");
                        return Err(ApiSessionError::InvalidCorrelationId(cid));
                    }
                    unique.push(cid);
                }
                unique
            }
        };

        let subs: Vec<Arc<Subscription>> = targets
            .iter()
            .filter_map(|cid| state.received.get(cid).map(|t| Arc::clone(&t.sub)))
            .collect();
        if let Some(mux) = &state.upstream {
            mux.unsubscribe(&subs)?;
        }

        let mut pages = Vec::new();
        for cid in &targets {
            if let Some(tracked) = state.received.remove(cid) {
                let mut buffer = tracked.buffer.lock();
                if !buffer.is_empty(0) {
                    pages.push(PolledPage::new(*cid, buffer.start_new_buffer()));
                }
            }
        }
        if state.received.is_empty() {
            state.reset();
        }
        let remaining = state.received.len();
        drop(state);
        self.data_ready.notify_waiters();

        debug!(removed = targets.len(), remaining, "unsubscribed");
        Ok(pages)
    }

    pub(crate) fn has_active(&self) -> bool {
        let mut state = self.state.lock();
        self.sync_with_upstream(&mut state);
        state.active().next().is_some()
    }

    pub(crate) fn validate_poll_id(&self, poll_id: Option<i64>) -> PollDecision {
        validate_poll_id(&mut self.state.lock().poll, poll_id)
    }

    pub(crate) fn record_success(&self, poll_id: i64) {
        self.state.lock().poll.last_success_poll_id = Some(poll_id);
    }

    pub(crate) fn data_ready(&self) -> &Notify {
        &self.data_ready
    }

    /// Rotate every active buffer if any of them holds data, returning the
    /// non-empty snapshots. Leaves the buffers alone otherwise so the
    /// previously delivered page stays at level 1.
    pub(crate) fn take_new_pages(&self) -> Vec<PolledPage> {
        let state = self.state.lock();
        let has_data = state.active().any(|(_, t)| !t.buffer.lock().is_empty(0));
        if !has_data {
            return Vec::new();
        }
        state
            .active()
            .filter_map(|(cid, t)| {
                let buffered = t.buffer.lock().start_new_buffer();
                (!buffered.buffer.is_empty()).then(|| PolledPage::new(*cid, buffered))
            })
            .collect()
    }

    pub(crate) fn old_pages(&self) -> Vec<PolledPage> {
        let state = self.state.lock();
        state
            .active()
            .filter_map(|(cid, t)| {
                let buffer = t.buffer.lock();
                (!buffer.is_empty(1)).then(|| PolledPage::new(*cid, buffer.get_buffer(1)))
            })
            .collect()
    }

    /// Drop everything bound to an upstream that has since terminated.
    fn sync_with_upstream(&self, state: &mut SessionState) {
        if state.upstream.as_ref().is_some_and(|mux| mux.is_terminated()) {
            warn!(
                client = %self.key,
                dropped = state.received.len(),
                "upstream session terminated, clearing subscriptions"
            );
            state.reset();
        }
    }
}

/// Buffers data ticks and wakes pollers on every event.
fn buffering_listener(
    client: ClientKey,
    cid: u64,
    buffer: SharedBuffer,
    ready: Arc<Notify>,
) -> impl Fn(SubscriptionEvent) + Send + Sync + 'static {
    move |event| match event {
        SubscriptionEvent::Data { data, .. } => {
            buffer.lock().push_value(data);
            ready.notify_waiters();
        }
        SubscriptionEvent::Error(err) => {
            warn!(client = %client, correlation_id = cid, error = %err, "subscription ended");
            ready.notify_waiters();
        }
    }
}

impl Expirable for ApiSession {
    fn expire(&self) -> bool {
        if self.in_use() > 0 {
            return false;
        }
        let mut state = self.state.lock();
        if let Some(mux) = state.upstream.take() {
            let subs: Vec<Arc<Subscription>> =
                state.active().map(|(_, t)| Arc::clone(&t.sub)).collect();
            if !subs.is_empty() && !mux.is_terminated() {
                if let Err(err) = mux.unsubscribe(&subs) {
                    warn!(client = %self.key, error = %err, "unsubscribe on expiry failed");
                }
            }
        }
        state.reset();
        self.expired.store(true, Ordering::SeqCst);
        drop(state);
        self.data_ready.notify_waiters();
        info!(client = %self.key, "api session expired");
        true
    }
}

impl std::fmt::Debug for ApiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSession")
            .field("key", &self.key)
            .field("in_use", &self.in_use())
            .field("expired", &self.is_expired())
            .finish_non_exhaustive()
    }
}

/// Keeps an [`ApiSession`] from being evicted while alive.
#[derive(Debug)]
pub struct InUseGuard {
    session: Arc<ApiSession>,
}

impl InUseGuard {
    /// The guarded session.
    pub fn session(&self) -> &Arc<ApiSession> {
        &self.session
    }
}

impl Deref for InUseGuard {
    type Target = ApiSession;

    fn deref(&self) -> &ApiSession {
        &self.session
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        let _ = self.session.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Removes a batch's entries unless committed, so a failed or abandoned
/// subscribe leaves nothing behind.
struct PendingBatch<'a> {
    session: &'a ApiSession,
    subs: &'a [Arc<Subscription>],
    armed: bool,
}

impl PendingBatch<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.session.state.lock();
        for sub in self.subs {
            let ours = state
                .received
                .get(&sub.correlation_id)
                .is_some_and(|t| Arc::ptr_eq(&t.sub, sub));
            if ours {
                let _ = state.received.remove(&sub.correlation_id);
            }
        }
        if state.received.is_empty() {
            state.reset();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
