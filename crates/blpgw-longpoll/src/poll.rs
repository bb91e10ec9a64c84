//! Poll-id sequencing and the long-poll wait.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::api_session::{ApiSession, PolledPage};
use crate::errors::PollError;

/// Per-client poll sequencing state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollState {
    /// Id of the most recent accepted poll.
    pub last_poll_id: Option<i64>,
    /// Id of the most recent poll that delivered data.
    pub last_success_poll_id: Option<i64>,
}

/// Outcome of checking a poll id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollDecision {
    /// Reject with a conflict.
    Invalid,
    /// Deliver data accumulated since the last successful poll.
    FetchNew,
    /// Re-deliver the previous page.
    FetchOld,
}

/// Check `poll_id` against `state`, recording it when accepted.
///
/// ```text
/// no id                         -> Invalid
/// first poll                    -> FetchNew
/// previous poll succeeded:
///     same id                   -> FetchOld
///     next id                   -> FetchNew
///     anything else             -> Invalid
/// previous poll still pending:
///     same id                   -> FetchNew (retry)
///     anything else             -> Invalid
/// ```
pub fn validate_poll_id(state: &mut PollState, poll_id: Option<i64>) -> PollDecision {
    let Some(poll_id) = poll_id else {
        return PollDecision::Invalid;
    };
    let decision = match state.last_poll_id {
        None => PollDecision::FetchNew,
        Some(last) if state.last_success_poll_id == Some(last) => {
            if poll_id == last {
                PollDecision::FetchOld
            } else if last.checked_add(1) == Some(poll_id) {
                PollDecision::FetchNew
            } else {
                PollDecision::Invalid
            }
        }
        Some(last) if poll_id == last => PollDecision::FetchNew,
        Some(_) => PollDecision::Invalid,
    };
    if decision != PollDecision::Invalid {
        state.last_poll_id = Some(poll_id);
    }
    decision
}

/// Serves polls against [`ApiSession`] buffers.
#[derive(Clone, Copy, Debug)]
pub struct LongPollCoordinator {
    timeout: Duration,
}

impl LongPollCoordinator {
    /// Coordinator that waits at most `timeout` for new data.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Server-side wait bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Serve one poll.
    ///
    /// Fetch-new returns as soon as any active subscription has data, waiting
    /// up to the timeout otherwise. Fetch-old returns the previously
    /// delivered page immediately. `cancel` ends a wait with no side effects.
    #[instrument(skip_all, fields(client = %session.key(), poll_id = ?poll_id))]
    pub async fn poll(
        &self,
        session: &ApiSession,
        poll_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolledPage>, PollError> {
        if !session.has_active() {
            return Err(PollError::NoActiveSubscriptions);
        }
        match session.validate_poll_id(poll_id) {
            PollDecision::Invalid => {
                debug!("invalid poll id");
                metrics::counter!("blpgw_polls_total", "outcome" => "conflict").increment(1);
                Err(PollError::InvalidPollId)
            }
            PollDecision::FetchOld => {
                debug!("resending previous page");
                metrics::counter!("blpgw_polls_total", "outcome" => "old").increment(1);
                Ok(session.old_pages())
            }
            PollDecision::FetchNew => {
                // validated ids are always present
                let poll_id = poll_id.unwrap_or_default();
                self.fetch_new(session, poll_id, cancel).await
            }
        }
    }

    async fn fetch_new(
        &self,
        session: &ApiSession,
        poll_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolledPage>, PollError> {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let ready = session.data_ready();
        loop {
            let notified = ready.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            if !session.has_active() {
                return Err(PollError::NoActiveSubscriptions);
            }
            let pages = session.take_new_pages();
            if !pages.is_empty() {
                session.record_success(poll_id);
                debug!(pages = pages.len(), "delivering new data");
                metrics::counter!("blpgw_polls_total", "outcome" => "data").increment(1);
                return Ok(pages);
            }

            tokio::select! {
                () = &mut deadline => {
                    let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                    debug!(timeout_ms, "poll timed out");
                    metrics::counter!("blpgw_polls_total", "outcome" => "timeout").increment(1);
                    return Err(PollError::Timeout { timeout_ms });
                }
                () = cancel.cancelled() => {
                    debug!("poll cancelled");
                    return Err(PollError::Cancelled);
                }
                () = notified => {}
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
