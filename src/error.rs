//! Canonical error type for the connection engine.
//!
//! The engine deals in error *kinds* rather than bespoke error types: a
//! handler failure, a routing failure, or a refused write all surface as a
//! variant of [`Error`]. Because handler errors are echoed back to the peer
//! inside the message envelope, the type is `Clone + PartialEq` and
//! round-trips the wire as display text. Transport I/O failures never enter
//! this enum; they terminate the reader or surface as a `false` write.

use thiserror::Error;

/// Errors produced by connection, namespace, and room operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The namespace is not declared locally or not joined by the peer.
    #[error("bad namespace")]
    BadNamespace,
    /// The room is not joined on this namespace connection.
    #[error("bad room")]
    BadRoom,
    /// The connection is closed; no further writes can succeed.
    #[error("write closed")]
    Write,
    /// The operation's deadline elapsed before completion.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// The operation's context was cancelled.
    #[error("context cancelled")]
    Cancelled,
    /// A handler-returned sentinel commanding the connection to close after
    /// the reply is written. `code` is the wire close code sent to the peer.
    #[error("close connection: {code}: {reason}")]
    Close { code: u16, reason: String },
    /// Any other error raised by a user event handler, carried as text.
    #[error("{0}")]
    Event(String),
}

impl Error {
    /// Wrap arbitrary handler error text.
    pub fn event(text: impl Into<String>) -> Self { Self::Event(text.into()) }

    /// Build a manual-close sentinel with the given wire close code.
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }

    /// Whether this error commands the connection to close after replying.
    #[must_use]
    pub fn is_manual_close(&self) -> bool { matches!(self, Self::Close { .. }) }

    /// Reconstruct an error from its wire text, mapping the protocol's known
    /// kinds back to their variants and everything else to [`Error::Event`].
    pub(crate) fn from_wire(text: &str) -> Self {
        match text {
            "bad namespace" => Self::BadNamespace,
            "bad room" => Self::BadRoom,
            "write closed" => Self::Write,
            "context deadline exceeded" => Self::DeadlineExceeded,
            "context cancelled" => Self::Cancelled,
            _ => text
                .strip_prefix("close connection: ")
                .and_then(|rest| rest.split_once(": "))
                .and_then(|(code, reason)| {
                    code.parse::<u16>().ok().map(|code| Self::Close {
                        code,
                        reason: reason.to_string(),
                    })
                })
                .unwrap_or_else(|| Self::Event(text.to_string())),
        }
    }
}

impl From<&str> for Error {
    fn from(text: &str) -> Self { Self::Event(text.to_string()) }
}

impl From<String> for Error {
    fn from(text: String) -> Self { Self::Event(text) }
}
