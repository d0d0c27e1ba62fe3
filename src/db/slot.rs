//! Single-capacity hand-off point for the session connection.
//!
//! The slot is a bounded `mpsc` channel of capacity one. The session
//! connection publishes itself after every reset, and `lease` drains it. The
//! session owns the only sender, so once a fatal close drops the session the
//! channel reports closure and waiters fail fast instead of hanging.

use crate::db::session::SessionConnection;
use crate::error::{DbError, DbResult};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellation context for a single `lease` call.
#[derive(Debug, Clone, Default)]
pub struct LeaseContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl LeaseContext {
    /// A context that never cancels.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled through `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Add (or tighten) a deadline `timeout` from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> DbError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => DbError::cancelled("context cancelled"),
                _ = tokio::time::sleep_until(deadline) => DbError::cancelled("deadline exceeded"),
            },
            None => {
                self.token.cancelled().await;
                DbError::cancelled("context cancelled")
            }
        }
    }
}

/// Outcome of publishing into a slot that could not take the session.
#[derive(Debug)]
pub(crate) enum PublishError {
    /// The slot already holds a session.
    Occupied(SessionConnection),
    /// The factory owning the slot is gone.
    Closed(SessionConnection),
}

/// Sending half of the slot, owned by the session connection.
#[derive(Debug, Clone)]
pub(crate) struct SlotPublisher {
    sender: mpsc::Sender<SessionConnection>,
}

impl SlotPublisher {
    pub(crate) fn publish(&self, session: SessionConnection) -> Result<(), PublishError> {
        self.sender.try_send(session).map_err(|e| match e {
            mpsc::error::TrySendError::Full(session) => PublishError::Occupied(session),
            mpsc::error::TrySendError::Closed(session) => PublishError::Closed(session),
        })
    }
}

/// Receiving half of the slot, owned by the factory.
#[derive(Debug)]
pub struct SessionSlot {
    receiver: Mutex<mpsc::Receiver<SessionConnection>>,
}

impl SessionSlot {
    pub(crate) fn new() -> (Self, SlotPublisher) {
        let (sender, receiver) = mpsc::channel(1);
        (
            Self {
                receiver: Mutex::new(receiver),
            },
            SlotPublisher { sender },
        )
    }

    /// Take the ready session, waiting until one is published.
    ///
    /// Cancellation is checked before the channel, so a cancelled context
    /// never consumes the session.
    pub(crate) async fn acquire(&self, ctx: &LeaseContext) -> DbResult<SessionConnection> {
        let received = tokio::select! {
            biased;
            err = ctx.done() => {
                debug!(error = %err, "Lease wait cancelled");
                return Err(err);
            }
            received = async { self.receiver.lock().await.recv().await } => received,
        };
        received.ok_or(DbError::SessionUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_is_never_done() {
        let ctx = LeaseContext::background();
        assert!(!ctx.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_token_resolves_done() {
        let ctx = LeaseContext::background();
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.done().await, DbError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_deadline_resolves_done() {
        let ctx = LeaseContext::with_timeout(Duration::from_millis(10));
        let err = ctx.done().await;
        assert!(err.to_string().contains("deadline exceeded"));
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_timeout_keeps_earliest_deadline() {
        let ctx = LeaseContext::with_timeout(Duration::from_millis(10));
        let first = ctx.deadline().unwrap();
        let ctx = ctx.timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(first));
    }

    #[tokio::test]
    async fn test_acquire_cancelled_on_empty_slot() {
        let (slot, _publisher) = SessionSlot::new();
        let ctx = LeaseContext::with_timeout(Duration::from_millis(20));
        let err = slot.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, DbError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_acquire_fails_when_publisher_dropped() {
        let (slot, publisher) = SessionSlot::new();
        drop(publisher);
        let err = slot.acquire(&LeaseContext::background()).await.unwrap_err();
        assert!(matches!(err, DbError::SessionUnavailable));
    }
}
