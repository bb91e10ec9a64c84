//! Per-URI memoization of service-open handshakes.
//!
//! The first caller for a URI starts the handshake; every concurrent caller
//! waits on the same attempt and all of them resolve or reject together. A
//! failure forgets the URI so the next caller starts a fresh attempt.

use std::collections::HashMap;

use blpgw_core::CorrelationId;
use tokio::sync::oneshot;

use crate::errors::{Result, SessionError};

/// Receiver side of a pending service open.
pub type OpenWaiter = oneshot::Receiver<Result<()>>;

enum ServiceState {
    Opening {
        id: CorrelationId,
        waiters: Vec<oneshot::Sender<Result<()>>>,
    },
    Open,
}

/// Outcome of [`ServiceCache::acquire`].
#[derive(Debug)]
pub enum Acquire {
    /// Already open.
    Ready,
    /// Another caller is opening it; wait on the receiver.
    Wait(OpenWaiter),
    /// This caller must issue the open with `id`, then wait on the receiver.
    Start {
        /// Correlation id reserved for the open.
        id: CorrelationId,
        /// Resolves when the open completes.
        waiter: OpenWaiter,
    },
}

/// Service handshake cache keyed by URI.
#[derive(Default)]
pub struct ServiceCache {
    entries: HashMap<String, ServiceState>,
}

impl ServiceCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join or start the open for `uri`. `next_id` is called only when a new
    /// attempt starts.
    pub fn acquire(&mut self, uri: &str, next_id: impl FnOnce() -> CorrelationId) -> Acquire {
        match self.entries.get_mut(uri) {
            Some(ServiceState::Open) => Acquire::Ready,
            Some(ServiceState::Opening { waiters, .. }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Acquire::Wait(rx)
            }
            None => {
                let id = next_id();
                let (tx, rx) = oneshot::channel();
                let _ = self.entries.insert(
                    uri.to_string(),
                    ServiceState::Opening {
                        id,
                        waiters: vec![tx],
                    },
                );
                Acquire::Start { id, waiter: rx }
            }
        }
    }

    /// Mark `uri` open and release its waiters.
    pub fn resolve(&mut self, uri: &str) {
        let Some(state) = self.entries.get_mut(uri) else {
            return;
        };
        if let ServiceState::Opening { waiters, .. } = std::mem::replace(state, ServiceState::Open) {
            for tx in waiters {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Forget `uri` and fail its waiters with `err`.
    pub fn reject(&mut self, uri: &str, err: &SessionError) {
        if let Some(ServiceState::Opening { waiters, .. }) = self.entries.remove(uri) {
            for tx in waiters {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// Fail every pending open and forget everything.
    pub fn fail_all(&mut self, err: &SessionError) {
        for (_, state) in self.entries.drain() {
            if let ServiceState::Opening { waiters, .. } = state {
                for tx in waiters {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }
    }

    /// Whether `uri` has completed its handshake.
    #[cfg(test)]
    pub(crate) fn is_open(&self, uri: &str) -> bool {
        matches!(self.entries.get(uri), Some(ServiceState::Open))
    }

    /// Correlation id of the in-flight open for `uri`.
    #[cfg(test)]
    pub(crate) fn pending_id(&self, uri: &str) -> Option<CorrelationId> {
        match self.entries.get(uri) {
            Some(ServiceState::Opening { id, .. }) => Some(*id),
            _ => None,
        }
    }
}
