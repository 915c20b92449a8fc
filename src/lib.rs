#![doc(html_root_url = "https://docs.rs/eventwire/latest")]
//! Connection engine for bidirectional, event-oriented messaging over a
//! message-framed full-duplex transport.
//!
//! One [`Conn`] drives one peer-to-peer link; either end may act as client
//! or server. The engine multiplexes named sub-channels ([namespaces]) and
//! sub-groups within them ([rooms]) over the single transport, dispatches
//! named events to registered handlers, and supports request/reply asks in
//! either direction.
//!
//! [namespaces]: crate::nsconn::NsConn
//! [rooms]: crate::room::Room

pub mod conn;
pub mod context;
pub mod error;
pub mod message;
pub mod namespaces;
pub mod nsconn;
pub mod room;
pub mod server;
pub mod socket;

pub use conn::{Conn, ConnConfig};
pub use context::Context;
pub use error::Error;
pub use message::{
    Message, ON_ANY_EVENT, ON_NAMESPACE_CONNECT, ON_NAMESPACE_CONNECTED, ON_NAMESPACE_DISCONNECT,
    ON_ROOM_JOIN, ON_ROOM_JOINED, ON_ROOM_LEAVE, ON_ROOM_LEFT,
};
pub use namespaces::{EventHandler, Events, Namespaces};
pub use nsconn::NsConn;
pub use room::Room;
pub use server::{IdGenerator, Server};
pub use socket::{FramedSocket, Socket, is_close_error};
