//! Shared upstream session.
//!
//! Every transport adapter asks the [`SessionProvider`] for the current
//! [`MultiplexedSession`]. The first caller starts one; concurrent callers
//! wait on the same start. A terminated session is replaced on next use.

use std::sync::Arc;
use std::time::Duration;

use blpgw_session::{
    MultiplexedSession, RawEvent, RawSession, SessionError, SimulatedConfig, SimulatedSession,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, instrument, warn};

use crate::metrics::UPSTREAM_SESSIONS_STARTED_TOTAL;

/// Builds raw sessions on demand.
pub trait RawSessionFactory: Send + Sync {
    /// A fresh raw session and its event stream.
    fn create(&self) -> (Arc<dyn RawSession>, mpsc::UnboundedReceiver<RawEvent>);
}

impl<F> RawSessionFactory for F
where
    F: Fn() -> (Arc<dyn RawSession>, mpsc::UnboundedReceiver<RawEvent>) + Send + Sync,
{
    fn create(&self) -> (Arc<dyn RawSession>, mpsc::UnboundedReceiver<RawEvent>) {
        self()
    }
}

/// Factory producing [`SimulatedSession`]s.
#[derive(Clone, Debug, Default)]
pub struct SimulatedFactory {
    config: SimulatedConfig,
}

impl SimulatedFactory {
    /// Factory for sessions configured with `config`.
    pub fn new(config: SimulatedConfig) -> Self {
        Self { config }
    }

    /// Factory ticking every `tick_interval` with `partial_responses` partials
    /// per request.
    pub fn ticking(tick_interval: Duration, partial_responses: usize) -> Self {
        Self::new(SimulatedConfig {
            tick_interval: (!tick_interval.is_zero()).then_some(tick_interval),
            partial_responses,
            ..SimulatedConfig::default()
        })
    }
}

impl RawSessionFactory for SimulatedFactory {
    fn create(&self) -> (Arc<dyn RawSession>, mpsc::UnboundedReceiver<RawEvent>) {
        let (session, events) = SimulatedSession::new(self.config.clone());
        let raw: Arc<dyn RawSession> = session;
        (raw, events)
    }
}

/// Lazily started, replace-on-termination upstream session.
pub struct SessionProvider {
    factory: Arc<dyn RawSessionFactory>,
    current: Mutex<Option<Arc<MultiplexedSession>>>,
}

impl SessionProvider {
    /// Provider building sessions with `factory`.
    pub fn new(factory: Arc<dyn RawSessionFactory>) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    /// The live session, starting a new one if there is none.
    #[instrument(skip_all)]
    pub async fn get(&self) -> Result<Arc<MultiplexedSession>, SessionError> {
        let mut current = self.current.lock().await;
        if let Some(mux) = current.as_ref() {
            if !mux.is_terminated() {
                return Ok(Arc::clone(mux));
            }
            warn!("upstream session terminated, starting a new one");
        }
        *current = None;

        let (raw, events) = self.factory.create();
        let mux = Arc::new(MultiplexedSession::new(raw, events));
        mux.start().await?;
        metrics::counter!(UPSTREAM_SESSIONS_STARTED_TOTAL).increment(1);
        info!("upstream session started");
        *current = Some(Arc::clone(&mux));
        Ok(mux)
    }

    /// Whether a started session is live.
    pub fn is_connected(&self) -> bool {
        self.current
            .try_lock()
            .is_ok_and(|current| current.as_ref().is_some_and(|mux| !mux.is_terminated()))
    }

    /// Stop the current session, if any.
    pub async fn stop(&self) {
        let Some(mux) = self.current.lock().await.take() else {
            return;
        };
        if let Err(err) = mux.stop().await {
            warn!(error = %err, "upstream session stop failed");
        }
        info!("upstream session stopped");
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use blpgw_session::RawCall;
    use parking_lot::Mutex as SyncMutex;

    use super::*;

    type Built = Arc<SyncMutex<Vec<Arc<SimulatedSession>>>>;

    /// Factory that keeps every simulated session it builds.
    fn recording(config: SimulatedConfig) -> (Arc<dyn RawSessionFactory>, Built) {
        let built = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&built);
        let factory = move || {
            let (sim, events) = SimulatedSession::new(config.clone());
            sink.lock().push(Arc::clone(&sim));
            let raw: Arc<dyn RawSession> = sim;
            (raw, events)
        };
        let factory: Arc<dyn RawSessionFactory> = Arc::new(factory);
        (factory, built)
    }

    #[tokio::test]
    async fn first_get_starts_one_session() {
        let (factory, built) = recording(SimulatedConfig::default());
        let provider = SessionProvider::new(factory);
        assert!(!provider.is_connected());

        let a = provider.get().await.unwrap();
        let b = provider.get().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(provider.is_connected());
        assert_eq!(built.lock().len(), 1);
        assert_eq!(built.lock()[0].calls(), vec![RawCall::Start]);
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_start() {
        let (factory, built) = recording(SimulatedConfig::default());
        let provider = SessionProvider::new(factory);
        let (a, b) = tokio::join!(provider.get(), provider.get());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(built.lock().len(), 1);
    }

    #[tokio::test]
    async fn terminated_session_is_replaced() {
        let (factory, built) = recording(SimulatedConfig::default());
        let provider = SessionProvider::new(factory);
        let first = provider.get().await.unwrap();

        built.lock()[0].terminate("lost");
        first.terminated().await;

        let second = provider.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(built.lock().len(), 2);
    }

    #[tokio::test]
    async fn start_failure_is_reported_and_retried() {
        let (factory, built) = recording(SimulatedConfig {
            fail_start: true,
            ..SimulatedConfig::default()
        });
        let provider = SessionProvider::new(factory);
        assert_matches!(provider.get().await, Err(SessionError::StartFailure(_)));
        assert_matches!(provider.get().await, Err(SessionError::StartFailure(_)));
        assert_eq!(built.lock().len(), 2);
        assert!(!provider.is_connected());
    }

    #[tokio::test]
    async fn stop_terminates_current() {
        let (factory, _built) = recording(SimulatedConfig::default());
        let provider = SessionProvider::new(factory);
        let mux = provider.get().await.unwrap();
        provider.stop().await;
        assert!(mux.is_terminated());
        assert!(!provider.is_connected());
    }
}
