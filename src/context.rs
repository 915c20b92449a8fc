//! Cancellation and deadline propagation for blocking operations.
//!
//! A [`Context`] bundles a [`CancellationToken`] with an optional deadline.
//! Every operation that can wait on the peer (`connect`, `wait_connect`,
//! `ask`, `disconnect_all`, the room exchanges) takes one and unwinds with
//! [`Error::Cancelled`] or [`Error::DeadlineExceeded`] when it fires.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Cancellation scope handed to waiting operations.
///
/// Cloning is cheap and shares the cancellation state: cancelling any clone
/// cancels them all. The default value never fires.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never cancels and has no deadline.
    #[must_use]
    pub fn background() -> Self { Self::default() }

    /// A cancellable context expiring `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A cancellable context expiring at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// The deadline, if one was set.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    /// Cancel this context and all of its clones.
    pub fn cancel(&self) { self.token.cancel(); }

    /// Whether [`Context::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// Resolve when the context is cancelled or its deadline passes.
    ///
    /// A context with neither never resolves; callers race it against their
    /// own completion.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.token.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {}
            },
            None => self.token.cancelled().await,
        }
    }

    /// The error explaining why [`Context::done`] resolved.
    #[must_use]
    pub fn err(&self) -> Error {
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            Error::DeadlineExceeded
        } else {
            Error::Cancelled
        }
    }
}
