//! A named sub-group within one namespace connection.

use std::sync::Weak;

use bytes::Bytes;

use crate::{context::Context, error::Error, nsconn::NsConn};

/// Membership handle for one room on one namespace connection.
///
/// Holds a non-owning back-pointer: once the namespace disconnects, any
/// outstanding `Room` handle turns into a benign dangling view whose
/// operations report failure.
#[derive(Debug)]
pub struct Room {
    name: String,
    ns: Weak<NsConn>,
}

impl Room {
    pub(crate) fn new(name: impl Into<String>, ns: Weak<NsConn>) -> Self {
        Self {
            name: name.into(),
            ns,
        }
    }

    /// The room name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Emit `event` scoped to this room; `false` when the namespace is gone
    /// or the write is refused.
    pub async fn emit(&self, event: &str, body: impl Into<Bytes>) -> bool {
        let Some(ns) = self.ns.upgrade() else {
            return false;
        };
        ns.emit_to_room(&self.name, event, body).await
    }

    /// Leave this room, completing the leave exchange with the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] when the namespace is gone, or any error the
    /// leave exchange produces.
    pub async fn leave(&self, ctx: &Context) -> Result<(), Error> {
        let ns = self.ns.upgrade().ok_or(Error::Write)?;
        ns.leave_room(ctx, &self.name).await
    }
}
