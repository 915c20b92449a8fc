//! The per-link connection state machine.
//!
//! One [`Conn`] drives one peer-to-peer link over a framed transport.
//! A single long-lived reader task owns inbound traffic: it completes the
//! `ack`/`ack_ok` handshake, queues frames that arrive before the
//! acknowledgement latch flips, correlates ask replies, answers the
//! namespace and room protocol exchanges, and dispatches everything else to
//! the user handler tables. Any number of caller tasks may concurrently
//! `write`, `ask`, `connect`, and `close`.
//!
//! State discipline: `acknowledged` and `closed` are atomic latches checked
//! without taking any lock; the connected-namespace map is guarded by an
//! async reader-writer lock (held across awaits only by `disconnect_all` and
//! `close`); the ask correlation table is a sync lock that is never held
//! across a suspension point.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock, PoisonError, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    sync::{RwLock, mpsc},
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;

use crate::{
    context::Context,
    error::Error,
    message::{
        Message, ON_NAMESPACE_CONNECT, ON_NAMESPACE_CONNECTED, ON_NAMESPACE_DISCONNECT,
        ON_ROOM_JOIN, ON_ROOM_LEAVE,
    },
    namespaces::Namespaces,
    nsconn::NsConn,
    server::Server,
    socket::{Socket, is_close_error},
};

pub(crate) const ACK: &[u8] = b"ack";
pub(crate) const ACK_OK: &[u8] = b"ack_ok";

/// Poll grain for readiness loops in `connect` and `wait_connect`.
const SYNC_WAIT: Duration = Duration::from_millis(15);

/// Grace window past a context deadline within which an ask is still issued.
const ASK_DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Per-connection socket deadlines. `None` means no deadline.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnConfig {
    /// Maximum wait for one inbound frame.
    pub read_timeout: Option<Duration>,
    /// Maximum wait for one outbound frame.
    pub write_timeout: Option<Duration>,
}

/// Back-reference held by server-side connections for deregistration.
pub(crate) struct ServerRef {
    pub(crate) server: Weak<Server>,
    pub(crate) disconnect: mpsc::UnboundedSender<Arc<Conn>>,
}

type WaitingMessages = HashMap<String, mpsc::Sender<Message>>;

/// One end of a peer-to-peer link.
pub struct Conn {
    weak: Weak<Conn>,
    /// Server-assigned identity, learned by the client during handshake.
    id: OnceLock<String>,
    socket: Arc<dyn Socket>,
    /// Present on server-side connections only.
    server: Option<ServerRef>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    /// The declared event tables; immutable after construction.
    namespaces: Arc<Namespaces>,
    acknowledged: AtomicBool,
    connected_namespaces: RwLock<HashMap<String, Arc<NsConn>>>,
    waiting_messages: StdRwLock<WaitingMessages>,
    wait_seq: AtomicU64,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl Conn {
    pub(crate) fn new(
        socket: Arc<dyn Socket>,
        namespaces: Arc<Namespaces>,
        server: Option<ServerRef>,
        config: ConnConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            id: OnceLock::new(),
            socket,
            server,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            namespaces,
            acknowledged: AtomicBool::new(false),
            connected_namespaces: RwLock::new(HashMap::new()),
            waiting_messages: StdRwLock::new(HashMap::new()),
            wait_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        })
    }

    /// Build the client side of a link: spawn the reader and open the
    /// handshake by sending the `ack` frame. The returned connection is not
    /// yet acknowledged; use [`Conn::wait_connect`] or poll
    /// [`Conn::is_acknowledged`] before expecting an identity.
    pub async fn client(
        socket: Arc<dyn Socket>,
        namespaces: Namespaces,
        config: ConnConfig,
    ) -> Arc<Self> {
        let conn = Self::new(socket, Arc::new(namespaces), None, config);
        tokio::spawn(Arc::clone(&conn).run_reader());
        if let Err(err) = conn.socket.write_text(ACK, conn.write_timeout).await {
            log::warn!("handshake send failed: {err}");
        }
        conn
    }

    pub(crate) fn set_id(&self, id: String) { let _ = self.id.set(id); }

    pub(crate) fn weak(&self) -> Weak<Conn> { self.weak.clone() }

    /// The connection identity; empty until the handshake commits it.
    #[must_use]
    pub fn id(&self) -> &str { self.id.get().map_or("", String::as_str) }

    /// The underlying transport.
    #[must_use]
    pub fn socket(&self) -> &Arc<dyn Socket> { &self.socket }

    /// The owning server, when this is a server-side connection.
    #[must_use]
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.as_ref().and_then(|s| s.server.upgrade())
    }

    /// Whether this is the dialing side of the link.
    #[must_use]
    pub fn is_client(&self) -> bool { self.server.is_none() }

    /// Whether the handshake has completed on this side.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool { self.acknowledged.load(Ordering::SeqCst) }

    /// Whether [`Conn::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::SeqCst) }

    /// Resolve once the connection closes. Useful for fan-out tasks that
    /// must stop publishing to this peer.
    pub async fn wait_close(&self) { self.close_token.cancelled().await; }

    /// The joined view of `namespace`, if its connect exchange completed.
    pub async fn namespace(&self, namespace: &str) -> Option<Arc<NsConn>> {
        self.connected_namespaces.read().await.get(namespace).cloned()
    }

    // ---- reader -----------------------------------------------------------

    /// Inbound loop: one per connection, owns the handshake and dispatch.
    /// Terminates on any transport error or on a manual-close handler and
    /// always tears the connection down on the way out.
    pub(crate) async fn run_reader(self: Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let mut queue: Vec<Message> = Vec::new();
        loop {
            let payload = match self.socket.read_text(self.read_timeout).await {
                Ok(payload) => payload,
                Err(err) => {
                    log::debug!("conn {}: reader stopped: {err}", self.id());
                    break;
                }
            };

            if !self.is_acknowledged() && payload.starts_with(ACK) {
                self.handle_ack(&payload, &mut queue).await;
                continue;
            }

            let msg = Message::deserialize(&payload);
            if msg.is_invalid {
                log::debug!("conn {}: dropping invalid {}-byte frame", self.id(), payload.len());
                continue;
            }
            if !self.is_acknowledged() {
                queue.push(msg);
                continue;
            }
            if !self.handle_message(msg).await {
                break;
            }
        }
        self.close().await;
    }

    async fn handle_ack(&self, payload: &[u8], queue: &mut Vec<Message>) {
        if self.is_client() {
            // `ack` suffixed with the server-assigned identity.
            let id = String::from_utf8_lossy(&payload[ACK.len()..]).into_owned();
            self.set_id(id);
            self.acknowledged.store(true, Ordering::SeqCst);
            if let Err(err) = self.socket.write_text(ACK_OK, self.write_timeout).await {
                log::warn!("handshake ack_ok send failed: {err}");
            }
            self.drain_queue(queue).await;
        } else if payload.len() == ACK.len() {
            let mut reply = ACK.to_vec();
            reply.extend_from_slice(self.id().as_bytes());
            if let Err(err) = self.socket.write_text(&reply, self.write_timeout).await {
                log::warn!("handshake id send failed: {err}");
            }
        } else {
            // `ack_ok`: the client holds the identity and is ready.
            self.acknowledged.store(true, Ordering::SeqCst);
            self.drain_queue(queue).await;
        }
    }

    /// Hand the pre-acknowledgement backlog to dispatch in arrival order.
    async fn drain_queue(&self, queue: &mut Vec<Message>) {
        for msg in queue.drain(..) {
            let _ = self.handle_message(msg).await;
        }
    }

    /// Dispatch one inbound message. Returns `false` when the handler asked
    /// for the connection to be closed after its reply was written.
    ///
    /// Check order matters: reply correlation preempts every other
    /// interpretation, so an ask reply is never also dispatched to a
    /// handler; the protocol exchanges come next; everything else goes to
    /// the namespace's event table.
    async fn handle_message(&self, mut msg: Message) -> bool {
        if !msg.wait.is_empty() {
            let slot = self.waiting_read().get(&msg.wait).cloned();
            if let Some(slot) = slot {
                let _ = slot.try_send(msg);
                return true;
            }
        }

        let event = msg.event.clone();
        match event.as_str() {
            ON_NAMESPACE_CONNECT => self.reply_connect(msg).await,
            ON_NAMESPACE_DISCONNECT => self.reply_disconnect(msg).await,
            ON_ROOM_JOIN => {
                if let Some(ns) = self.try_namespace(&msg).await {
                    ns.reply_room_join(msg).await;
                }
            }
            ON_ROOM_LEAVE => {
                if let Some(ns) = self.try_namespace(&msg).await {
                    ns.reply_room_leave(msg).await;
                }
            }
            _ => {
                let Some(ns) = self.try_namespace(&msg).await else {
                    return true;
                };
                msg.is_local = false;
                if let Err(err) = ns.events.fire_event(&ns, msg.clone()).await {
                    let manual_close = err.is_manual_close();
                    msg.err = Some(err);
                    self.write(msg).await;
                    if manual_close {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Resolve the joined namespace for an inbound message, answering with
    /// [`Error::BadNamespace`] when it is not joined.
    async fn try_namespace(&self, msg: &Message) -> Option<Arc<NsConn>> {
        match self.namespace(&msg.namespace).await {
            Some(ns) => Some(ns),
            None => {
                let mut reply = msg.clone();
                reply.err = Some(Error::BadNamespace);
                self.write(reply).await;
                None
            }
        }
    }

    // ---- connect protocol -------------------------------------------------

    /// Join `namespace`, completing the connect exchange with the peer.
    ///
    /// A server-initiated connect first waits for its own handshake to
    /// settle. Already-joined namespaces return their existing view with no
    /// wire traffic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadNamespace`] when `namespace` is not declared on
    /// either side, the context error on cancellation, [`Error::Write`] on a
    /// closed connection, or the local connect handler's veto.
    pub async fn connect(&self, ctx: &Context, namespace: &str) -> Result<Arc<NsConn>, Error> {
        if !self.is_client() {
            while !self.is_acknowledged() {
                if self.is_closed() {
                    return Err(Error::Write);
                }
                tokio::select! {
                    () = ctx.done() => return Err(ctx.err()),
                    () = sleep(SYNC_WAIT) => {}
                }
            }
        }
        self.ask_connect(ctx, namespace).await
    }

    /// Wait until `namespace` is joined and the handshake has settled,
    /// whichever side initiates the connect.
    ///
    /// Unlike [`Conn::connect`] this never fails with
    /// [`Error::BadNamespace`]; an undeclared namespace simply waits until
    /// the context fires.
    ///
    /// # Errors
    ///
    /// Returns the context error on cancellation or deadline.
    pub async fn wait_connect(&self, ctx: &Context, namespace: &str) -> Result<Arc<NsConn>, Error> {
        loop {
            if self.is_acknowledged() {
                if let Some(ns) = self.namespace(namespace).await {
                    return Ok(ns);
                }
            }
            tokio::select! {
                () = ctx.done() => return Err(ctx.err()),
                () = sleep(SYNC_WAIT) => {}
            }
        }
    }

    async fn ask_connect(&self, ctx: &Context, namespace: &str) -> Result<Arc<NsConn>, Error> {
        if let Some(ns) = self.namespace(namespace).await {
            return Ok(ns);
        }
        let events = self.namespaces.get(namespace).ok_or(Error::BadNamespace)?;

        let mut connect = Message::protocol(namespace, ON_NAMESPACE_CONNECT);
        connect.is_local = true;
        // The peer answers even when it is already connected (no-op reply).
        self.ask(ctx, connect.clone()).await?;

        // A connect initiated by the peer may have completed while we waited.
        if let Some(ns) = self.namespace(namespace).await {
            return Ok(ns);
        }

        let ns = NsConn::new(self.weak(), namespace.to_string(), Arc::clone(&events));
        events.fire_event(&ns, connect.clone()).await?;
        {
            let mut connected = self.connected_namespaces.write().await;
            if let Some(existing) = connected.get(namespace) {
                return Ok(Arc::clone(existing));
            }
            connected.insert(namespace.to_string(), Arc::clone(&ns));
        }

        connect.event = ON_NAMESPACE_CONNECTED.to_string();
        let _ = events.fire_event(&ns, connect).await;
        Ok(ns)
    }

    /// Answer a peer-initiated connect request.
    async fn reply_connect(&self, mut msg: Message) {
        // Answer even when already connected, as a no-op the asker unblocks on.
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }
        if self.namespace(&msg.namespace).await.is_some() {
            msg.is_noop = true;
            self.write(msg).await;
            return;
        }
        let Some(events) = self.namespaces.get(&msg.namespace) else {
            msg.err = Some(Error::BadNamespace);
            self.write(msg).await;
            return;
        };

        let ns = NsConn::new(self.weak(), msg.namespace.clone(), Arc::clone(&events));
        if let Err(err) = events.fire_event(&ns, msg.clone()).await {
            msg.err = Some(err);
            self.write(msg).await;
            return;
        }
        {
            let mut connected = self.connected_namespaces.write().await;
            if connected.contains_key(&msg.namespace) {
                drop(connected);
                msg.is_noop = true;
                self.write(msg).await;
                return;
            }
            connected.insert(msg.namespace.clone(), Arc::clone(&ns));
        }
        self.write(msg.clone()).await;

        msg.event = ON_NAMESPACE_CONNECTED.to_string();
        let _ = events.fire_event(&ns, msg).await;
    }

    // ---- disconnect protocol ----------------------------------------------

    /// Disconnect every joined namespace, stopping at the first refusal.
    ///
    /// The namespace map's write lock is held across the whole traversal,
    /// so no connect exchange can interleave with the teardown.
    ///
    /// # Errors
    ///
    /// Propagates the first error any disconnect exchange produces.
    pub async fn disconnect_all(&self, ctx: &Context) -> Result<(), Error> {
        let mut connected = self.connected_namespaces.write().await;
        let names: Vec<String> = connected.keys().cloned().collect();
        for namespace in names {
            let msg = Message::protocol(namespace, ON_NAMESPACE_DISCONNECT);
            let ns = connected
                .get(&msg.namespace)
                .cloned()
                .ok_or(Error::BadNamespace)?;
            self.ask(ctx, msg.clone()).await?;
            connected.remove(&msg.namespace);
            self.fire_local_disconnect(&ns, msg).await;
        }
        Ok(())
    }

    pub(crate) async fn ask_disconnect(&self, ctx: &Context, msg: Message) -> Result<(), Error> {
        let ns = self
            .namespace(&msg.namespace)
            .await
            .ok_or(Error::BadNamespace)?;
        self.ask(ctx, msg.clone()).await?;
        self.connected_namespaces.write().await.remove(&msg.namespace);
        self.fire_local_disconnect(&ns, msg).await;
        Ok(())
    }

    async fn fire_local_disconnect(&self, ns: &Arc<NsConn>, mut msg: Message) {
        msg.is_local = true;
        let _ = ns.events.fire_event(ns, msg).await;
    }

    /// Answer a peer-initiated disconnect request.
    ///
    /// On the client the peer's word is final: drop the namespace, reply,
    /// then inform the local handler. On the server the local handler runs
    /// first and may refuse the disconnect by returning an error, which is
    /// sent back in place of the acknowledgement.
    async fn reply_disconnect(&self, mut msg: Message) {
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }
        let Some(ns) = self.namespace(&msg.namespace).await else {
            return;
        };

        if self.is_client() {
            self.connected_namespaces.write().await.remove(&msg.namespace);
            self.write(msg.clone()).await;
            let _ = ns.events.fire_event(&ns, msg).await;
            return;
        }

        match ns.events.fire_event(&ns, msg.clone()).await {
            Ok(()) => {
                self.connected_namespaces.write().await.remove(&msg.namespace);
            }
            Err(err) => msg.err = Some(err),
        }
        self.write(msg).await;
    }

    // ---- write and ask ----------------------------------------------------

    /// Serialise and send `msg`, returning whether it was put on the wire.
    ///
    /// Refused without emitting bytes when the connection is closed, when
    /// the message's namespace is not joined (connect/disconnect exchanges
    /// excepted), or when it is scoped to a room the namespace has not
    /// joined (join/leave exchanges excepted). A close-class transport error
    /// tears the connection down.
    pub async fn write(&self, msg: Message) -> bool {
        if self.is_closed() {
            return false;
        }

        if !msg.is_connect() && !msg.is_disconnect() {
            let Some(ns) = self.namespace(&msg.namespace).await else {
                return false;
            };
            if !msg.room.is_empty()
                && !msg.is_room_join()
                && !msg.is_room_left()
                && !ns.in_room(&msg.room)
            {
                return false;
            }
        }

        match self
            .socket
            .write_text(&msg.serialize(), self.write_timeout)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                if is_close_error(&err) {
                    self.close().await;
                }
                false
            }
        }
    }

    /// Send `msg` stamped with a fresh correlation token and wait for the
    /// peer's reply to it.
    ///
    /// A context whose deadline lies more than a second in the past fails
    /// immediately without writing. Cancellation abandons the waiting slot;
    /// a late reply lands in its buffer and the slot is reaped on close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] when the connection is closed or the write
    /// is refused, the context error on cancellation or deadline, or the
    /// error carried by the peer's reply.
    pub async fn ask(&self, ctx: &Context, mut msg: Message) -> Result<Message, Error> {
        if self.is_closed() {
            return Err(Error::Write);
        }
        if let Some(deadline) = ctx.deadline() {
            if Instant::now().saturating_duration_since(deadline) > ASK_DEADLINE_GRACE {
                return Err(Error::DeadlineExceeded);
            }
        }

        let token = self.next_wait_token();
        msg.wait = token.clone();

        // Single-element buffer: a reply that crosses a cancellation parks
        // there instead of blocking the reader.
        let (slot, mut replies) = mpsc::channel(1);
        self.waiting_write().insert(token.clone(), slot);

        if !self.write(msg).await {
            self.waiting_write().remove(&token);
            return Err(Error::Write);
        }

        tokio::select! {
            () = ctx.done() => Err(ctx.err()),
            () = self.close_token.cancelled() => Err(Error::Write),
            reply = replies.recv() => {
                self.waiting_write().remove(&token);
                match reply {
                    Some(reply) => match reply.err.clone() {
                        Some(err) => Err(err),
                        None => Ok(reply),
                    },
                    None => Err(Error::Write),
                }
            }
        }
    }

    /// Correlation tokens are unique per connection; the client prefixes
    /// its tokens so both sides' clocks can share the client's wait map.
    fn next_wait_token(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_nanos());
        let seq = self.wait_seq.fetch_add(1, Ordering::SeqCst);
        if self.is_client() {
            format!("client_{nanos}.{seq}")
        } else {
            format!("{nanos}.{seq}")
        }
    }

    // ---- close ------------------------------------------------------------

    /// Tear the connection down. Idempotent and safe under concurrent
    /// invocation; only the winning caller runs the teardown:
    /// signal closure, fire a forced local disconnect for every joined
    /// namespace and empty the map, abandon every pending ask, reset the
    /// acknowledgement latch, notify the owning server, and shut the
    /// transport down.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // Cancel first: asks blocked on replies unwind before the namespace
        // lock is taken below.
        self.close_token.cancel();

        {
            let mut connected = self.connected_namespaces.write().await;
            for (namespace, ns) in connected.drain() {
                let mut msg = Message::protocol(namespace, ON_NAMESPACE_DISCONNECT);
                msg.is_forced = true;
                msg.is_local = true;
                let _ = ns.events.fire_event(&ns, msg).await;
            }
        }

        self.waiting_write().clear();
        self.acknowledged.store(false, Ordering::SeqCst);

        if let Some(server) = &self.server {
            if let Some(conn) = self.weak.upgrade() {
                let _ = server.disconnect.send(conn);
            }
        }
        self.socket.shutdown();
    }

    fn waiting_read(&self) -> RwLockReadGuard<'_, WaitingMessages> {
        self.waiting_messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn waiting_write(&self) -> RwLockWriteGuard<'_, WaitingMessages> {
        self.waiting_messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id())
            .field("client", &self.is_client())
            .field("acknowledged", &self.is_acknowledged())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use super::{Conn, ConnConfig};
    use crate::{namespaces::Namespaces, socket::FramedSocket};

    #[tokio::test]
    async fn client_wait_tokens_are_unique_and_prefixed() {
        let (a, _b) = tokio::io::duplex(256);
        let conn = Conn::client(
            Arc::new(FramedSocket::new(a)),
            Namespaces::new(),
            ConnConfig::default(),
        )
        .await;

        let tokens: Vec<String> = (0..64).map(|_| conn.next_wait_token()).collect();
        let distinct: HashSet<&String> = tokens.iter().collect();
        assert_eq!(distinct.len(), tokens.len());
        assert!(tokens.iter().all(|token| token.starts_with("client_")));
        conn.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = tokio::io::duplex(256);
        let conn = Conn::client(
            Arc::new(FramedSocket::new(a)),
            Namespaces::new(),
            ConnConfig {
                read_timeout: Some(Duration::from_millis(50)),
                write_timeout: None,
            },
        )
        .await;

        conn.close().await;
        assert!(conn.is_closed());
        assert!(!conn.is_acknowledged());
        conn.close().await;
        assert!(conn.is_closed());
    }
}
