//! Cancellation and deadline propagation for transport calls.
//!
//! A [`Context`] is cheap to clone and is threaded through every transport
//! operation and the retry loop. Cancellation is cooperative: operations
//! consult the context before they launch work and while they sleep, but an
//! exec that is already in flight is not interrupted.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Reasons a context stops permitting new work.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum ContextError {
    /// The context, or one of its parents, was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,
    /// The context deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Carries a cancellation signal and an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Returns a context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a child context that expires after `timeout`.
    ///
    /// The child keeps the earlier of its own deadline and the parent's.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context that expires at `deadline`.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let effective = self
            .deadline
            .map_or(deadline, |parent| parent.min(deadline));
        Self {
            token: self.token.child_token(),
            deadline: Some(effective),
        }
    }

    /// Derives a child context sharing the parent's deadline. Cancelling the
    /// child leaves the parent untouched.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Reports whether the context still permits new work.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Cancelled`] after [`Context::cancel`] and
    /// [`ContextError::DeadlineExceeded`] once the deadline has passed.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.token.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        if self
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Err(ContextError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => ContextError::Cancelled,
                    () = sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn background_context_permits_work() {
        assert_eq!(Context::background().check(), Ok(()));
    }

    #[rstest]
    fn cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();

        assert_eq!(child.check(), Err(ContextError::Cancelled));
        assert_eq!(parent.check(), Ok(()));

        let other = parent.child();
        parent.cancel();
        assert_eq!(other.check(), Err(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn expired_deadline_is_reported() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn child_keeps_earlier_parent_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn done_resolves_on_cancel() {
        let ctx = Context::background();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.done().await });
        ctx.cancel();
        let reason = handle.await.expect("join waiter");
        assert_eq!(reason, ContextError::Cancelled);
    }
}
