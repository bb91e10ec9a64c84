//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.
//!
//! Subscriptions are scoped to the connection and forwarded as they arrive,
//! without buffering. A subscribe that completes after the socket closed is
//! rolled back, and disconnect releases everything still active.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use blpgw_core::ConnectionId;
use blpgw_longpoll::SubscriptionSpec;
use blpgw_session::{MultiplexedSession, Subscription, SubscriptionEvent};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::connection::WsConnection;
use super::protocol::{
    ClientCommand, ServerMessage, WsError, parse_command, parse_subscriptions, parse_unsubscribe,
};
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};
use crate::server::AppState;

/// Interval between server-initiated Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound frames queued per connection before new ones are dropped.
const OUTBOUND_CAPACITY: usize = 1024;

/// How long queued frames may take to flush after the read side ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Sent before closing a socket whose upstream session died.
const TERMINATED_MESSAGE: &str = "Session terminated unexpectedly.";

struct Entry {
    subscription: Arc<Subscription>,
    active: bool,
}

/// Subscriptions owned by one connection.
pub(crate) struct WsClient {
    connection: Arc<WsConnection>,
    state: AppState,
    /// Received subscriptions by client correlation id; pending ones are
    /// inactive until the upstream acknowledges them.
    subscriptions: Mutex<BTreeMap<u64, Entry>>,
    upstream: Mutex<Option<Arc<MultiplexedSession>>>,
}

impl WsClient {
    pub(crate) fn new(connection: Arc<WsConnection>, state: AppState) -> Arc<Self> {
        Arc::new(Self {
            connection,
            state,
            subscriptions: Mutex::new(BTreeMap::new()),
            upstream: Mutex::new(None),
        })
    }

    fn reject(&self, err: &impl std::fmt::Display) {
        debug!(connection = %self.connection.id, error = %err, "command rejected");
        let _ = self.connection.send(&ServerMessage::error(err));
    }

    /// Dispatch one text frame. Subscribes run in their own task.
    pub(crate) fn handle_text(self: &Arc<Self>, text: &str) {
        match parse_command(text) {
            Ok(ClientCommand::Subscribe(data)) => {
                let client = Arc::clone(self);
                let _ = tokio::spawn(async move { client.subscribe(data).await });
            }
            Ok(ClientCommand::Unsubscribe(data)) => self.unsubscribe(data.as_ref()),
            Ok(ClientCommand::Other(kind)) => debug!(kind = %kind, "ignoring message"),
            Err(err) => self.reject(&err),
        }
    }

    pub(crate) async fn subscribe(self: Arc<Self>, data: Option<Value>) {
        info!(connection = %self.connection.id, "subscribe request received");
        if self.state.config.log_request_body {
            debug!(body = ?data, "subscribe body");
        }
        let batch = match parse_subscriptions(data).and_then(|specs| self.register(specs)) {
            Ok(batch) => batch,
            Err(err) => return self.reject(&err),
        };

        let mux = match self.state.provider.get().await {
            Ok(mux) => mux,
            Err(err) => {
                error!(error = %err, "upstream session unavailable");
                self.forget(&batch);
                return self.reject(&err);
            }
        };
        self.bind_upstream(&mux);

        if let Err(err) = mux.subscribe(&batch).await {
            error!(error = %err, "subscribe failed");
            self.forget(&batch);
            return self.reject(&err);
        }
        if self.activate(&batch) {
            debug!(count = batch.len(), "subscribed");
            let _ = self.connection.send(&ServerMessage::Subscribed);
        } else {
            if let Err(err) = mux.unsubscribe(&batch) {
                warn!(error = %err, "rollback unsubscribe failed");
            }
            self.forget(&batch);
            debug!("socket closed before subscribe completed, rolled back");
        }
    }

    /// Record `specs` as pending. The whole batch is refused if any id is
    /// already received or repeated.
    fn register(&self, specs: Vec<SubscriptionSpec>) -> Result<Vec<Arc<Subscription>>, WsError> {
        let mut subscriptions = self.subscriptions.lock();
        let mut seen = HashSet::new();
        for spec in &specs {
            if subscriptions.contains_key(&spec.correlation_id) || !seen.insert(spec.correlation_id) {
                return Err(WsError::DuplicateCorrelationId);
            }
        }
        let batch = specs
            .into_iter()
            .map(|spec| {
                let id = spec.correlation_id;
                let subscription = Subscription::new(
                    id,
                    spec.security,
                    spec.fields,
                    spec.options,
                    forwarding_listener(Arc::clone(&self.connection), id),
                );
                let _ = subscriptions.insert(
                    id,
                    Entry {
                        subscription: Arc::clone(&subscription),
                        active: false,
                    },
                );
                subscription
            })
            .collect();
        Ok(batch)
    }

    /// Mark `batch` active, unless the connection closed meanwhile.
    fn activate(&self, batch: &[Arc<Subscription>]) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        if self.connection.is_closed() {
            return false;
        }
        for subscription in batch {
            if let Some(entry) = subscriptions.get_mut(&subscription.correlation_id) {
                entry.active = true;
            }
        }
        true
    }

    fn forget(&self, batch: &[Arc<Subscription>]) {
        let mut subscriptions = self.subscriptions.lock();
        for subscription in batch {
            let id = subscription.correlation_id;
            if subscriptions
                .get(&id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.subscription, subscription))
            {
                let _ = subscriptions.remove(&id);
            }
        }
    }

    /// Remember the upstream session and close the socket if it terminates.
    fn bind_upstream(&self, mux: &Arc<MultiplexedSession>) {
        {
            let mut upstream = self.upstream.lock();
            if upstream.as_ref().is_some_and(|current| Arc::ptr_eq(current, mux)) {
                return;
            }
            *upstream = Some(Arc::clone(mux));
        }
        let terminated = mux.termination_token();
        let connection = Arc::clone(&self.connection);
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = terminated.cancelled() => {
                    if !connection.is_closed() {
                        warn!(connection = %connection.id, "upstream session terminated, closing socket");
                        let _ = connection.send(&ServerMessage::Err {
                            message: TERMINATED_MESSAGE.into(),
                        });
                        connection.close();
                    }
                }
                () = connection.closing().cancelled() => {}
            }
        });
    }

    pub(crate) fn unsubscribe(&self, data: Option<&Value>) {
        info!(connection = %self.connection.id, "unsubscribe request received");
        let mut subscriptions = self.subscriptions.lock();
        let active: Vec<u64> = subscriptions
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(id, _)| *id)
            .collect();
        if active.is_empty() {
            drop(subscriptions);
            return self.reject(&WsError::NoActiveSubscriptions);
        }

        let chosen = match parse_unsubscribe(data) {
            None => active,
            Some(mut ids) => {
                ids.retain(|id| active.contains(id));
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        };
        if chosen.is_empty() {
            drop(subscriptions);
            return self.reject(&WsError::NoValidCorrelationId);
        }

        let handles: Vec<Arc<Subscription>> = chosen
            .iter()
            .filter_map(|id| subscriptions.get(id))
            .map(|entry| Arc::clone(&entry.subscription))
            .collect();
        let upstream = self.upstream.lock().clone();
        if let Some(mux) = upstream {
            if let Err(err) = mux.unsubscribe(&handles) {
                drop(subscriptions);
                error!(error = %err, "unsubscribe failed");
                let message = format!("error unsubscribing: {err}");
                return self.reject(&message);
            }
        }
        for id in &chosen {
            let _ = subscriptions.remove(id);
        }
        let reply = if subscriptions.is_empty() {
            ServerMessage::UnsubscribedAll
        } else {
            ServerMessage::Unsubscribed
        };
        let remaining = subscriptions.len();
        drop(subscriptions);
        debug!(remaining, "unsubscribed");
        let _ = self.connection.send(&reply);
    }

    /// Unsubscribe everything still active. Pending subscribes roll
    /// themselves back once they see the closed connection.
    pub(crate) fn release_all(&self) {
        let active: Vec<Arc<Subscription>> = {
            let mut subscriptions = self.subscriptions.lock();
            let active = subscriptions
                .values()
                .filter(|entry| entry.active)
                .map(|entry| Arc::clone(&entry.subscription))
                .collect();
            subscriptions.clear();
            active
        };
        if active.is_empty() {
            return;
        }
        let upstream = self.upstream.lock().clone();
        if let Some(mux) = upstream.filter(|mux| !mux.is_terminated()) {
            if let Err(err) = mux.unsubscribe(&active) {
                warn!(error = %err, "unsubscribe on disconnect failed");
            }
        }
        debug!(count = active.len(), "unsubscribed all active subscriptions");
    }

    #[cfg(test)]
    fn active_ids(&self) -> Vec<u64> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(id, _)| *id)
            .collect()
    }
}

fn forwarding_listener(
    connection: Arc<WsConnection>,
    correlation_id: u64,
) -> impl Fn(SubscriptionEvent) + Send + Sync + 'static {
    move |event| match event {
        SubscriptionEvent::Data { data, .. } => {
            if !connection.send(&ServerMessage::Data {
                correlation_id,
                data,
            }) {
                debug!(connection = %connection.id, correlation_id, "tick not delivered");
            }
        }
        SubscriptionEvent::Error(err) => {
            debug!(connection = %connection.id, correlation_id, error = %err, "subscription ended");
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Sends a `connected` frame
/// 2. Dispatches incoming text frames as subscribe/unsubscribe commands
/// 3. Forwards outbound frames via the send channel, with periodic Pings
/// 4. Releases the client's subscriptions on disconnect
#[instrument(skip_all, fields(connection = %id))]
pub async fn run_ws_session(ws: WebSocket, id: ConnectionId, state: AppState, identity: Option<String>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(OUTBOUND_CAPACITY);
    let connection = Arc::new(WsConnection::new(id, send_tx));
    let client = WsClient::new(Arc::clone(&connection), state.clone());

    info!("client connected");
    if state.config.log_client_detail {
        debug!(identity = ?identity, "client detail");
    }
    let _ = state.ws_connections.fetch_add(1, Ordering::Relaxed);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let _ = connection.send(&ServerMessage::Connected);

    let closing = connection.closing().clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        let _ = ping_interval.tick().await;
        loop {
            tokio::select! {
                () = closing.cancelled() => {
                    while let Ok(text) = send_rx.try_recv() {
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            return;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let shutdown = state.shutdown.token();
    loop {
        let frame = tokio::select! {
            () = connection.closing().cancelled() => break,
            () = shutdown.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => client.handle_text(text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => client.handle_text(text),
                Err(_) => debug!(len = data.len(), "received non-UTF8 binary frame"),
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                debug!("client sent close frame");
                break;
            }
            Some(Err(err)) => {
                debug!(error = %err, "socket read failed");
                break;
            }
        }
    }

    connection.close();
    client.release_all();
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut outbound).await.is_err() {
        outbound.abort();
    }

    let _ = state.ws_connections.fetch_sub(1, Ordering::Relaxed);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(
        dropped = connection.drop_count(),
        secs = connection.connected_at.elapsed().as_secs(),
        "client disconnected"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use blpgw_session::{SimulatedConfig, SimulatedSession};
    use serde_json::json;

    use super::*;
    use crate::config::ServerConfig;
    use crate::provider::RawSessionFactory;
    use crate::server::GatewayServer;

    type Built = Arc<Mutex<Vec<Arc<SimulatedSession>>>>;

    struct Fixture {
        client: Arc<WsClient>,
        connection: Arc<WsConnection>,
        rx: mpsc::Receiver<Arc<String>>,
        built: Built,
    }

    impl Fixture {
        fn new(config: SimulatedConfig) -> Self {
            let built: Built = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&built);
            let factory = move || {
                let (sim, events) = SimulatedSession::new(config.clone());
                sink.lock().push(Arc::clone(&sim));
                let raw: Arc<dyn blpgw_session::RawSession> = sim;
                (raw, events)
            };
            let factory: Arc<dyn RawSessionFactory> = Arc::new(factory);
            let server = GatewayServer::new(ServerConfig::default(), factory, None);
            let (tx, rx) = mpsc::channel(64);
            let connection = Arc::new(WsConnection::new(ConnectionId::new(), tx));
            let client = WsClient::new(Arc::clone(&connection), server.state());
            Self {
                client,
                connection,
                rx,
                built,
            }
        }

        fn sim(&self) -> Arc<SimulatedSession> {
            Arc::clone(&self.built.lock()[0])
        }

        async fn next_frame(&mut self) -> Value {
            let text = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .unwrap()
                .unwrap();
            serde_json::from_str(&text).unwrap()
        }

        async fn subscribe(&self, data: Value) {
            Arc::clone(&self.client).subscribe(Some(data)).await;
        }
    }

    fn entry(id: u64) -> Value {
        json!({"correlationId": id, "security": "IBM US Equity", "fields": ["LAST_PRICE"]})
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn subscribe_acknowledges_and_forwards_ticks() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.subscribe(json!([entry(7)])).await;
        assert_eq!(fx.next_frame().await, json!({"type": "subscribed"}));
        assert_eq!(fx.client.active_ids(), vec![7]);

        let sim = fx.sim();
        let upstream = sim.subscribed_ids()[0];
        sim.emit_data(upstream, "MarketDataEvents", json!({"LAST_PRICE": 10.5}));
        assert_eq!(
            fx.next_frame().await,
            json!({"type": "data", "data": {"correlationId": 7, "data": {"LAST_PRICE": 10.5}}})
        );
    }

    #[tokio::test]
    async fn invalid_subscribes_are_reported() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.subscribe(json!([])).await;
        assert_eq!(fx.next_frame().await["data"]["message"], "No valid subscriptions found.");

        fx.subscribe(json!([{"correlationId": 1}])).await;
        assert_eq!(fx.next_frame().await["data"]["message"], "Invalid subscription option.");

        fx.subscribe(json!([entry(1), entry(1)])).await;
        assert_eq!(fx.next_frame().await["data"]["message"], "Correlation Id already exists.");
        assert!(fx.client.active_ids().is_empty());
    }

    #[tokio::test]
    async fn duplicate_of_received_id_is_rejected() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.subscribe(json!([entry(1)])).await;
        let _ = fx.next_frame().await;
        fx.subscribe(json!([entry(2), entry(1)])).await;
        assert_eq!(fx.next_frame().await["data"]["message"], "Correlation Id already exists.");
        assert_eq!(fx.client.active_ids(), vec![1]);
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_nothing_behind() {
        let mut fx = Fixture::new(SimulatedConfig {
            failing_services: vec!["//blp/mktbar".into()],
            ..SimulatedConfig::default()
        });
        fx.subscribe(json!([
            {"correlationId": 1, "security": "//blp/mktbar/ticker/B", "fields": ["OPEN"]}
        ]))
        .await;
        let frame = fx.next_frame().await;
        assert_eq!(frame["type"], "err");
        assert!(fx.client.subscriptions.lock().is_empty());

        fx.subscribe(json!([entry(1)])).await;
        assert_eq!(fx.next_frame().await, json!({"type": "subscribed"}));
    }

    #[tokio::test]
    async fn unsubscribe_some_then_all() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.subscribe(json!([entry(1), entry(2)])).await;
        let _ = fx.next_frame().await;

        fx.client.unsubscribe(Some(&json!({"correlationIds": [1, 99]})));
        assert_eq!(fx.next_frame().await, json!({"type": "unsubscribed"}));
        assert_eq!(fx.client.active_ids(), vec![2]);

        fx.client.unsubscribe(None);
        assert_eq!(fx.next_frame().await, json!({"type": "unsubscribed all"}));
        assert!(fx.sim().subscribed_ids().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_errors() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.client.unsubscribe(None);
        assert_eq!(fx.next_frame().await["data"]["message"], "No active subscriptions.");

        fx.subscribe(json!([entry(1)])).await;
        let _ = fx.next_frame().await;
        fx.client.unsubscribe(Some(&json!({"correlationIds": [5]})));
        assert_eq!(fx.next_frame().await["data"]["message"], "No valid correlation Id.");
        assert_eq!(fx.client.active_ids(), vec![1]);
    }

    #[tokio::test]
    async fn subscribe_completing_after_close_is_rolled_back() {
        let fx = Fixture::new(SimulatedConfig::default());
        fx.connection.close();
        fx.subscribe(json!([entry(3)])).await;
        assert!(fx.client.subscriptions.lock().is_empty());
        assert!(fx.sim().subscribed_ids().is_empty());
    }

    #[tokio::test]
    async fn release_all_unsubscribes_upstream() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.subscribe(json!([entry(1), entry(2)])).await;
        let _ = fx.next_frame().await;
        assert_eq!(fx.sim().subscribed_ids().len(), 2);

        fx.connection.close();
        fx.client.release_all();
        assert!(fx.sim().subscribed_ids().is_empty());
        assert!(fx.client.subscriptions.lock().is_empty());
    }

    #[tokio::test]
    async fn termination_reports_and_closes() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.subscribe(json!([entry(1)])).await;
        let _ = fx.next_frame().await;

        fx.sim().terminate("lost");
        settle().await;
        assert_eq!(
            fx.next_frame().await,
            json!({"type": "err", "data": {"message": "Session terminated unexpectedly."}})
        );
        assert!(fx.connection.is_closed());
    }

    #[tokio::test]
    async fn text_frames_dispatch() {
        let mut fx = Fixture::new(SimulatedConfig::default());
        fx.client.handle_text("{");
        assert_eq!(fx.next_frame().await["data"]["message"], "Invalid message received.");

        fx.client
            .handle_text(&json!({"type": "subscribe", "data": [entry(4)]}).to_string());
        assert_eq!(fx.next_frame().await, json!({"type": "subscribed"}));

        fx.client.handle_text(r#"{"type":"unsubscribe"}"#);
        assert_eq!(fx.next_frame().await, json!({"type": "unsubscribed all"}));
    }
}
