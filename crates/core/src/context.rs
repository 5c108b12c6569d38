//! Per-turn call context.

use tokio_util::sync::CancellationToken;
use triage_types::CorrelationId;

/// Carried through every external call made while processing one turn.
///
/// The correlation id is attached to logs and outbound requests; the cancellation token is
/// triggered when the caller goes away. Only waits (run polling, retry backoff) observe the
/// token, so work that has already committed clinical data is never abandoned half-way.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub correlation_id: CorrelationId,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            cancel: CancellationToken::new(),
        }
    }

    /// Context with a fresh correlation id and no external cancellation.
    pub fn detached() -> Self {
        Self::new(CorrelationId::generate())
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
