//! Declared namespaces and their event handler tables.
//!
//! A [`Namespaces`] value is the immutable declaration a connection is built
//! with: which namespaces may be joined and, per namespace, which events the
//! application handles. Handlers are async callbacks keyed by event name;
//! the reserved `_On*` names from [`crate::message`] hook the protocol
//! exchanges themselves.

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    error::Error,
    message::{Message, ON_ANY_EVENT},
    nsconn::NsConn,
};

/// Boxed event callback stored in an [`Events`] table.
pub type EventHandler =
    Box<dyn Fn(Arc<NsConn>, Message) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Event-name to handler table for one namespace.
///
/// Built with the [`Events::on`] chain and frozen once declared:
///
/// ```
/// use eventwire::{Events, Namespaces};
///
/// let namespaces = Namespaces::new().namespace(
///     "chat",
///     Events::new().on("echo", |ns, msg| async move {
///         if let Some(conn) = ns.conn() {
///             conn.write(msg).await;
///         }
///         Ok(())
///     }),
/// );
/// # drop(namespaces);
/// ```
#[derive(Default)]
pub struct Events {
    handlers: HashMap<String, EventHandler>,
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Events {
    /// An empty handler table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `handler` for `event`, replacing any previous entry.
    ///
    /// The handler receives the namespace connection the event fired on and
    /// the message, and its error (if any) is echoed back to the peer.
    #[must_use]
    pub fn on<H, Fut>(mut self, event: impl Into<String>, handler: H) -> Self
    where
        H: Fn(Arc<NsConn>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.handlers
            .insert(event.into(), Box::new(move |ns, msg| Box::pin(handler(ns, msg))));
        self
    }

    /// Dispatch `msg` to its handler, falling back to the
    /// [`ON_ANY_EVENT`] catch-all when no dedicated entry exists.
    pub(crate) async fn fire_event(&self, ns: &Arc<NsConn>, msg: Message) -> Result<(), Error> {
        if let Some(handler) = self.handlers.get(&msg.event) {
            return handler(Arc::clone(ns), msg).await;
        }
        if let Some(handler) = self.handlers.get(ON_ANY_EVENT) {
            return handler(Arc::clone(ns), msg).await;
        }
        Ok(())
    }
}

/// The set of namespaces a connection declares at construction.
#[derive(Default)]
pub struct Namespaces {
    inner: HashMap<String, Arc<Events>>,
}

impl Namespaces {
    /// An empty declaration.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Declare `name` with its handler table.
    #[must_use]
    pub fn namespace(mut self, name: impl Into<String>, events: Events) -> Self {
        self.inner.insert(name.into(), Arc::new(events));
        self
    }

    /// Look up the handler table declared for `name`.
    pub(crate) fn get(&self, name: &str) -> Option<Arc<Events>> { self.inner.get(name).cloned() }
}
