//! Namespace-scoped view over a connection.
//!
//! An [`NsConn`] is created by the connect exchange and destroyed on
//! disconnect or connection close. It owns the namespace's room membership
//! and is the receiver user event handlers are invoked on. The connection
//! owns the `NsConn`; the back-pointer here is weak, so an outstanding
//! handle never extends the connection's lifetime.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
};

use bytes::Bytes;

use crate::{
    conn::Conn,
    context::Context,
    error::Error,
    message::{
        Message, ON_NAMESPACE_DISCONNECT, ON_ROOM_JOIN, ON_ROOM_JOINED, ON_ROOM_LEAVE,
        ON_ROOM_LEFT,
    },
    namespaces::Events,
    room::Room,
};

/// One joined namespace on one connection.
#[derive(Debug)]
pub struct NsConn {
    weak: Weak<NsConn>,
    conn: Weak<Conn>,
    namespace: String,
    pub(crate) events: Arc<Events>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl NsConn {
    pub(crate) fn new(conn: Weak<Conn>, namespace: String, events: Arc<Events>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            conn,
            namespace,
            events,
            rooms: RwLock::new(HashMap::new()),
        })
    }

    /// The namespace this view is scoped to.
    #[must_use]
    pub fn namespace(&self) -> &str { &self.namespace }

    /// The owning connection, unless it has been dropped.
    #[must_use]
    pub fn conn(&self) -> Option<Arc<Conn>> { self.conn.upgrade() }

    fn handle(&self) -> Option<Arc<NsConn>> { self.weak.upgrade() }

    /// Emit `event` on this namespace; `false` when the write is refused.
    pub async fn emit(&self, event: &str, body: impl Into<Bytes>) -> bool {
        let Some(conn) = self.conn() else {
            return false;
        };
        conn.write(Message::new(self.namespace.clone(), event, body))
            .await
    }

    /// Ask the peer and wait for its reply to `event`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] when the connection is gone or closed, the
    /// context error on cancellation, or the error the peer replied with.
    pub async fn ask(
        &self,
        ctx: &Context,
        event: &str,
        body: impl Into<Bytes>,
    ) -> Result<Message, Error> {
        let conn = self.conn().ok_or(Error::Write)?;
        conn.ask(ctx, Message::new(self.namespace.clone(), event, body))
            .await
    }

    /// The room handle for `name`, if joined.
    #[must_use]
    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms_read().get(name).cloned()
    }

    pub(crate) fn in_room(&self, name: &str) -> bool { self.rooms_read().contains_key(name) }

    /// Join `room_name`, completing the join exchange with the peer.
    ///
    /// Already-joined rooms return their existing handle without wire
    /// traffic. The local [`ON_ROOM_JOIN`] handler may veto the join by
    /// returning an error; [`ON_ROOM_JOINED`] fires after membership is
    /// recorded and cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] when the connection is gone, the context
    /// error on cancellation, the peer's refusal, or the local veto.
    pub async fn join_room(&self, ctx: &Context, room_name: &str) -> Result<Arc<Room>, Error> {
        if let Some(room) = self.room(room_name) {
            return Ok(room);
        }
        let conn = self.conn().ok_or(Error::Write)?;
        let this = self.handle().ok_or(Error::Write)?;

        let mut join = Message::protocol(self.namespace.clone(), ON_ROOM_JOIN);
        join.room = room_name.to_string();
        join.is_local = true;
        conn.ask(ctx, join.clone()).await?;

        // A join initiated by the peer may have raced in while we waited.
        if let Some(room) = self.room(room_name) {
            return Ok(room);
        }

        self.events.fire_event(&this, join.clone()).await?;
        let room = Arc::new(Room::new(room_name, self.weak.clone()));
        self.rooms_write()
            .insert(room_name.to_string(), Arc::clone(&room));

        join.event = ON_ROOM_JOINED.to_string();
        let _ = self.events.fire_event(&this, join).await;
        Ok(room)
    }

    /// Leave `room_name`, completing the leave exchange with the peer.
    ///
    /// The local [`ON_ROOM_LEAVE`] handler may veto the leave by returning
    /// an error, in which case membership is kept; [`ON_ROOM_LEFT`] fires
    /// after membership is removed and cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRoom`] when not a member, [`Error::Write`] when
    /// the connection is gone, any error the exchange produces, or the
    /// local veto.
    pub async fn leave_room(&self, ctx: &Context, room_name: &str) -> Result<(), Error> {
        if !self.in_room(room_name) {
            return Err(Error::BadRoom);
        }
        let conn = self.conn().ok_or(Error::Write)?;
        let this = self.handle().ok_or(Error::Write)?;

        let mut leave = Message::protocol(self.namespace.clone(), ON_ROOM_LEAVE);
        leave.room = room_name.to_string();
        leave.is_local = true;
        conn.ask(ctx, leave.clone()).await?;

        self.events.fire_event(&this, leave.clone()).await?;
        self.rooms_write().remove(room_name);

        leave.event = ON_ROOM_LEFT.to_string();
        let _ = self.events.fire_event(&this, leave).await;
        Ok(())
    }

    /// Leave every joined room, stopping at the first failing exchange.
    ///
    /// # Errors
    ///
    /// Propagates the first error any leave exchange produces.
    pub async fn leave_all(&self, ctx: &Context) -> Result<(), Error> {
        let names: Vec<String> = self.rooms_read().keys().cloned().collect();
        for name in names {
            self.leave_room(ctx, &name).await?;
        }
        Ok(())
    }

    /// Disconnect this namespace, completing the exchange with the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Write`] when the connection is gone, the context
    /// error on cancellation, or the peer's refusal.
    pub async fn disconnect(&self, ctx: &Context) -> Result<(), Error> {
        let conn = self.conn().ok_or(Error::Write)?;
        conn.ask_disconnect(
            ctx,
            Message::protocol(self.namespace.clone(), ON_NAMESPACE_DISCONNECT),
        )
        .await
    }

    pub(crate) async fn emit_to_room(
        &self,
        room_name: &str,
        event: &str,
        body: impl Into<Bytes>,
    ) -> bool {
        let Some(conn) = self.conn() else {
            return false;
        };
        let mut msg = Message::new(self.namespace.clone(), event, body);
        msg.room = room_name.to_string();
        conn.write(msg).await
    }

    pub(crate) async fn reply_room_join(&self, mut msg: Message) {
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }
        let (Some(conn), Some(this)) = (self.conn(), self.handle()) else {
            return;
        };
        if self.in_room(&msg.room) {
            msg.is_noop = true;
            conn.write(msg).await;
            return;
        }
        if let Err(err) = self.events.fire_event(&this, msg.clone()).await {
            msg.err = Some(err);
            conn.write(msg).await;
            return;
        }
        let room = Arc::new(Room::new(msg.room.clone(), self.weak.clone()));
        self.rooms_write().insert(msg.room.clone(), room);
        conn.write(msg.clone()).await;

        msg.event = ON_ROOM_JOINED.to_string();
        let _ = self.events.fire_event(&this, msg).await;
    }

    pub(crate) async fn reply_room_leave(&self, mut msg: Message) {
        if msg.wait.is_empty() || msg.is_noop {
            return;
        }
        let (Some(conn), Some(this)) = (self.conn(), self.handle()) else {
            return;
        };
        if !self.in_room(&msg.room) {
            msg.is_noop = true;
            conn.write(msg).await;
            return;
        }
        if let Err(err) = self.events.fire_event(&this, msg.clone()).await {
            msg.err = Some(err);
            conn.write(msg).await;
            return;
        }
        self.rooms_write().remove(&msg.room);
        conn.write(msg.clone()).await;

        msg.event = ON_ROOM_LEFT.to_string();
        let _ = self.events.fire_event(&this, msg).await;
    }

    fn rooms_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn rooms_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.write().unwrap_or_else(PoisonError::into_inner)
    }
}
