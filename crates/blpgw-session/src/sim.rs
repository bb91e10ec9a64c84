//! In-process raw session.
//!
//! Answers service opens and requests immediately, optionally ticks
//! subscriptions on a timer, records every call, and lets the owner inject
//! arbitrary events or terminate the session. Used by the binary when no
//! upstream is configured and by tests as the injected double.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blpgw_core::CorrelationId;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::{Result, SessionError};
use crate::names::{events_for_service, response_name, service_for_security};
use crate::raw::{EventType, RawEvent, RawMessage, RawSession, SubscriptionRequest};

/// Behaviour knobs for [`SimulatedSession`].
#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    /// Emit a data tick per subscription at this interval; `None` disables ticks.
    pub tick_interval: Option<Duration>,
    /// Answer requests immediately; when `false` responses must be injected.
    pub respond_to_requests: bool,
    /// Partial responses emitted before each final response.
    pub partial_responses: usize,
    /// Service URIs whose open fails.
    pub failing_services: Vec<String>,
    /// Make `start` fail.
    pub fail_start: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            tick_interval: None,
            respond_to_requests: true,
            partial_responses: 1,
            failing_services: Vec::new(),
            fail_start: false,
        }
    }
}

/// A call made against the simulated session.
#[derive(Clone, Debug, PartialEq)]
pub enum RawCall {
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `open_service`
    OpenService {
        /// Service URI.
        uri: String,
        /// Correlation id.
        id: CorrelationId,
    },
    /// `request`
    Request {
        /// Service URI.
        uri: String,
        /// Request name.
        name: String,
        /// Correlation id.
        id: CorrelationId,
    },
    /// `subscribe`
    Subscribe(Vec<SubscriptionRequest>),
    /// `unsubscribe`
    Unsubscribe(Vec<CorrelationId>),
}

/// Scripted raw session.
pub struct SimulatedSession {
    config: SimulatedConfig,
    events: mpsc::UnboundedSender<RawEvent>,
    calls: Mutex<Vec<RawCall>>,
    subscribed: Mutex<BTreeMap<CorrelationId, SubscriptionRequest>>,
    tickers: Mutex<HashMap<CorrelationId, JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl SimulatedSession {
    /// Create a session and the event stream it emits on.
    pub fn new(config: SimulatedConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<RawEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            config,
            events,
            calls: Mutex::new(Vec::new()),
            subscribed: Mutex::new(BTreeMap::new()),
            tickers: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
        });
        (session, rx)
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<RawCall> {
        self.calls.lock().clone()
    }

    /// Number of `open_service` calls for `uri`.
    pub fn open_service_count(&self, uri: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, RawCall::OpenService { uri: u, .. } if u == uri))
            .count()
    }

    /// Correlation ids currently subscribed upstream.
    pub fn subscribed_ids(&self) -> Vec<CorrelationId> {
        self.subscribed.lock().keys().copied().collect()
    }

    /// Inject an arbitrary event.
    pub fn emit(&self, event: RawEvent) {
        let _ = self.events.send(event);
    }

    /// Inject one subscription data message.
    pub fn emit_data(&self, id: CorrelationId, message_type: &str, data: Value) {
        self.emit(RawEvent::Message(RawMessage {
            correlation_id: id,
            message_type: message_type.to_string(),
            event_type: None,
            data,
        }));
    }

    /// Simulate an upstream disconnect.
    pub fn terminate(&self, reason: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tickers();
        self.emit(RawEvent::SessionTerminated {
            reason: reason.to_string(),
        });
    }

    fn record(&self, call: RawCall) {
        self.calls.lock().push(call);
    }

    fn check_live(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SessionError::Terminated);
        }
        Ok(())
    }

    fn stop_tickers(&self) {
        for (_, handle) in self.tickers.lock().drain() {
            handle.abort();
        }
    }

    fn spawn_ticker(&self, request: &SubscriptionRequest, period: Duration) -> JoinHandle<()> {
        let tx = self.events.clone();
        let id = request.correlation_id;
        let message_type = tick_event(service_for_security(&request.security)).to_string();
        let security = request.security.clone();
        let fields = request.fields.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let _ = interval.tick().await;
            let mut seq: u64 = 0;
            loop {
                let _ = interval.tick().await;
                seq += 1;
                let event = RawEvent::Message(RawMessage {
                    correlation_id: id,
                    message_type: message_type.clone(),
                    event_type: None,
                    data: tick_payload(&security, &fields, seq),
                });
                if tx.send(event).is_err() {
                    break;
                }
            }
        })
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.stop_tickers();
    }
}

fn tick_event(uri: &str) -> &'static str {
    let events = events_for_service(uri);
    if uri == "//blp/mktbar" {
        "MarketBarUpdate"
    } else {
        events[0]
    }
}

fn tick_payload(security: &str, fields: &[String], seq: u64) -> Value {
    let mut data = serde_json::Map::new();
    let _ = data.insert("security".into(), json!(security));
    let _ = data.insert("sequence".into(), json!(seq));
    for field in fields {
        let _ = data.insert(field.clone(), json!(100 + seq));
    }
    Value::Object(data)
}

#[async_trait]
impl RawSession for SimulatedSession {
    async fn start(&self) -> Result<()> {
        self.record(RawCall::Start);
        self.check_live()?;
        if self.config.fail_start {
            return Err(SessionError::StartFailure(
                "simulated startup failure".into(),
            ));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record(RawCall::Stop);
        self.terminate("session stopped");
        Ok(())
    }

    fn open_service(&self, uri: &str, id: CorrelationId) -> Result<()> {
        self.record(RawCall::OpenService {
            uri: uri.to_string(),
            id,
        });
        self.check_live()?;
        if self.config.failing_services.iter().any(|s| s == uri) {
            self.emit(RawEvent::ServiceOpenFailure {
                correlation_id: id,
                reason: format!("Could not open service {uri}"),
            });
        } else {
            self.emit(RawEvent::ServiceOpened { correlation_id: id });
        }
        Ok(())
    }

    fn request(&self, uri: &str, name: &str, payload: Value, id: CorrelationId) -> Result<()> {
        self.record(RawCall::Request {
            uri: uri.to_string(),
            name: name.to_string(),
            id,
        });
        self.check_live()?;
        if !self.config.respond_to_requests {
            return Ok(());
        }
        let message_type = response_name(name);
        let total = self.config.partial_responses + 1;
        for sequence in 0..total {
            let event_type = if sequence + 1 == total {
                EventType::Response
            } else {
                EventType::PartialResponse
            };
            self.emit(RawEvent::Message(RawMessage {
                correlation_id: id,
                message_type: message_type.clone(),
                event_type: Some(event_type),
                data: json!({ "request": name, "sequence": sequence, "echo": payload }),
            }));
        }
        Ok(())
    }

    fn subscribe(&self, subscriptions: &[SubscriptionRequest]) -> Result<()> {
        self.record(RawCall::Subscribe(subscriptions.to_vec()));
        self.check_live()?;
        let mut subscribed = self.subscribed.lock();
        for request in subscriptions {
            let _ = subscribed.insert(request.correlation_id, request.clone());
            if let Some(period) = self.config.tick_interval {
                let handle = self.spawn_ticker(request, period);
                let _ = self.tickers.lock().insert(request.correlation_id, handle);
            }
        }
        debug!(count = subscriptions.len(), "simulated subscribe");
        Ok(())
    }

    fn unsubscribe(&self, ids: &[CorrelationId]) -> Result<()> {
        self.record(RawCall::Unsubscribe(ids.to_vec()));
        self.check_live()?;
        let mut subscribed = self.subscribed.lock();
        let mut tickers = self.tickers.lock();
        for id in ids {
            let _ = subscribed.remove(id);
            if let Some(handle) = tickers.remove(id) {
                handle.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn open_service_emits_opened() {
        let (sim, mut rx) = SimulatedSession::new(SimulatedConfig::default());
        sim.open_service("//blp/refdata", CorrelationId::new(0)).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(RawEvent::ServiceOpened {
                correlation_id: CorrelationId::new(0)
            })
        );
        assert_eq!(sim.open_service_count("//blp/refdata"), 1);
    }

    #[tokio::test]
    async fn failing_service_emits_failure() {
        let (sim, mut rx) = SimulatedSession::new(SimulatedConfig {
            failing_services: vec!["//blp/bad".into()],
            ..SimulatedConfig::default()
        });
        sim.open_service("//blp/bad", CorrelationId::new(1)).unwrap();
        assert_matches!(rx.recv().await, Some(RawEvent::ServiceOpenFailure { reason, .. }) if reason.contains("//blp/bad"));
    }

    #[tokio::test]
    async fn request_emits_partials_then_final() {
        let (sim, mut rx) = SimulatedSession::new(SimulatedConfig {
            partial_responses: 2,
            ..SimulatedConfig::default()
        });
        sim.request("//blp/refdata", "ReferenceDataRequest", json!({}), CorrelationId::new(3))
            .unwrap();
        let mut types = Vec::new();
        for _ in 0..3 {
            let Some(RawEvent::Message(m)) = rx.recv().await else {
                panic!("expected message");
            };
            assert_eq!(m.message_type, "ReferenceDataResponse");
            types.push(m.event_type);
        }
        assert_eq!(
            types,
            vec![
                Some(EventType::PartialResponse),
                Some(EventType::PartialResponse),
                Some(EventType::Response)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_unsubscribed() {
        let (sim, mut rx) = SimulatedSession::new(SimulatedConfig {
            tick_interval: Some(Duration::from_millis(100)),
            ..SimulatedConfig::default()
        });
        let id = CorrelationId::new(7);
        sim.subscribe(&[SubscriptionRequest {
            correlation_id: id,
            security: "IBM US Equity".into(),
            fields: vec!["LAST_PRICE".into()],
            options: None,
        }])
        .unwrap();

        let Some(RawEvent::Message(m)) = rx.recv().await else {
            panic!("expected tick");
        };
        assert_eq!(m.correlation_id, id);
        assert_eq!(m.message_type, "MarketDataEvents");
        assert_eq!(m.data["LAST_PRICE"], 101);

        sim.unsubscribe(&[id]).unwrap();
        assert!(sim.subscribed_ids().is_empty());
    }

    #[tokio::test]
    async fn terminate_is_emitted_once_and_blocks_calls() {
        let (sim, mut rx) = SimulatedSession::new(SimulatedConfig::default());
        sim.terminate("link down");
        sim.terminate("again");
        assert_matches!(rx.recv().await, Some(RawEvent::SessionTerminated { reason }) if reason == "link down");
        assert_eq!(
            sim.open_service("//blp/refdata", CorrelationId::new(0)),
            Err(SessionError::Terminated)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_failure() {
        let (sim, _rx) = SimulatedSession::new(SimulatedConfig {
            fail_start: true,
            ..SimulatedConfig::default()
        });
        assert_matches!(sim.start().await, Err(SessionError::StartFailure(_)));
        assert_eq!(sim.calls(), vec![RawCall::Start]);
    }
}
