//! The wire message value type and its serialisation.
//!
//! A [`Message`] is one logical frame exchanged between peers: an event name
//! scoped to a namespace (and optionally a room), a binary body, and the
//! protocol bookkeeping that rides along with it (correlation token, error
//! envelope, no-op marker). The wire format is a seven-field text layout
//! owned by this module; the handshake frames (`ack`/`ack_ok`) are the only
//! payloads that bypass it.

use bytes::Bytes;

use crate::error::Error;

/// Fired once the connect exchange for a namespace begins on this side.
pub const ON_NAMESPACE_CONNECT: &str = "_OnNamespaceConnect";
/// Fired after a namespace is inserted into the connected set.
pub const ON_NAMESPACE_CONNECTED: &str = "_OnNamespaceConnected";
/// Fired when a namespace is disconnected, locally or by the peer.
pub const ON_NAMESPACE_DISCONNECT: &str = "_OnNamespaceDisconnect";
/// Fired when a room join is requested on this namespace.
pub const ON_ROOM_JOIN: &str = "_OnRoomJoin";
/// Fired after a room has been joined.
pub const ON_ROOM_JOINED: &str = "_OnRoomJoined";
/// Fired when a room leave is requested on this namespace.
pub const ON_ROOM_LEAVE: &str = "_OnRoomLeave";
/// Fired after a room has been left.
pub const ON_ROOM_LEFT: &str = "_OnRoomLeft";
/// Catch-all handler invoked for events with no dedicated entry.
pub const ON_ANY_EVENT: &str = "_OnAnyEvent";

const SEPARATOR: u8 = b';';
const FIELD_COUNT: usize = 7;

/// One logical frame of the protocol.
///
/// Field names that start with `is_` are local dispatch flags; of those only
/// `is_noop` crosses the wire. The `namespace`, `room`, and `event` fields
/// must not contain the `;` separator; the body is the unsplit remainder of
/// the frame and may hold arbitrary bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Namespace this message is scoped to.
    pub namespace: String,
    /// Room this message is scoped to, empty when unscoped.
    pub room: String,
    /// Event name; reserved `_On*` names carry protocol meaning.
    pub event: String,
    /// User payload.
    pub body: Bytes,
    /// Error envelope, populated instead of `body` on the wire.
    pub err: Option<Error>,
    /// Correlation token for ask/reply pairs, empty otherwise.
    pub(crate) wait: String,
    /// Set on disconnect events fired during connection close.
    pub is_forced: bool,
    /// Set on events fired by the local side rather than received.
    pub is_local: bool,
    /// Marks a reply that acknowledges an already-satisfied request.
    pub is_noop: bool,
    /// Set only by deserialisation on malformed input.
    pub(crate) is_invalid: bool,
}

impl Message {
    /// Build a user event message.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        event: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            event: event.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub(crate) fn protocol(namespace: impl Into<String>, event: &str) -> Self {
        Self {
            namespace: namespace.into(),
            event: event.to_string(),
            ..Self::default()
        }
    }

    fn invalid() -> Self {
        Self {
            is_invalid: true,
            ..Self::default()
        }
    }

    /// Whether this is a namespace connect request or reply.
    #[must_use]
    pub fn is_connect(&self) -> bool { self.event == ON_NAMESPACE_CONNECT }

    /// Whether this is a namespace disconnect request or reply.
    #[must_use]
    pub fn is_disconnect(&self) -> bool { self.event == ON_NAMESPACE_DISCONNECT }

    /// Whether this belongs to the room join exchange.
    #[must_use]
    pub fn is_room_join(&self) -> bool {
        self.event == ON_ROOM_JOIN || self.event == ON_ROOM_JOINED
    }

    /// Whether this belongs to the room leave exchange.
    #[must_use]
    pub fn is_room_left(&self) -> bool {
        self.event == ON_ROOM_LEAVE || self.event == ON_ROOM_LEFT
    }

    /// Encode into the seven-field wire layout:
    /// `wait;namespace;room;event;isError;isNoOp;body`.
    ///
    /// When an error envelope is present its display text occupies the body
    /// position and the `isError` flag is set. `is_forced` and `is_local`
    /// never cross the wire.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let error_text = self.err.as_ref().map(ToString::to_string);
        let body: &[u8] = match &error_text {
            Some(text) => text.as_bytes(),
            None => &self.body,
        };

        let mut out = Vec::with_capacity(
            self.wait.len()
                + self.namespace.len()
                + self.room.len()
                + self.event.len()
                + body.len()
                + FIELD_COUNT + 1,
        );
        out.extend_from_slice(self.wait.as_bytes());
        out.push(SEPARATOR);
        out.extend_from_slice(self.namespace.as_bytes());
        out.push(SEPARATOR);
        out.extend_from_slice(self.room.as_bytes());
        out.push(SEPARATOR);
        out.extend_from_slice(self.event.as_bytes());
        out.push(SEPARATOR);
        out.push(if error_text.is_some() { b'1' } else { b'0' });
        out.push(SEPARATOR);
        out.push(if self.is_noop { b'1' } else { b'0' });
        out.push(SEPARATOR);
        out.extend_from_slice(body);
        out
    }

    /// Decode a frame previously produced by [`Message::serialize`].
    ///
    /// Malformed input (short field count, invalid flag bytes, non-UTF-8
    /// header fields, empty payload) yields a message whose invalid marker is
    /// set; the reader drops such frames silently.
    #[must_use]
    pub fn deserialize(payload: &[u8]) -> Self {
        if payload.is_empty() {
            return Self::invalid();
        }

        let mut fields: [&[u8]; FIELD_COUNT - 1] = [&[]; FIELD_COUNT - 1];
        let mut rest = payload;
        for field in &mut fields {
            let Some(idx) = rest.iter().position(|b| *b == SEPARATOR) else {
                return Self::invalid();
            };
            *field = &rest[..idx];
            rest = &rest[idx + 1..];
        }

        let [wait, namespace, room, event, is_error, is_noop] = fields;
        let (Ok(wait), Ok(namespace), Ok(room), Ok(event)) = (
            std::str::from_utf8(wait),
            std::str::from_utf8(namespace),
            std::str::from_utf8(room),
            std::str::from_utf8(event),
        ) else {
            return Self::invalid();
        };
        let (Some(is_error), Some(is_noop)) = (parse_flag(is_error), parse_flag(is_noop)) else {
            return Self::invalid();
        };

        let (body, err) = if is_error {
            match std::str::from_utf8(rest) {
                Ok(text) => (Bytes::new(), Some(Error::from_wire(text))),
                Err(_) => return Self::invalid(),
            }
        } else {
            (Bytes::copy_from_slice(rest), None)
        };

        Self {
            namespace: namespace.to_string(),
            room: room.to_string(),
            event: event.to_string(),
            body,
            err,
            wait: wait.to_string(),
            is_noop,
            ..Self::default()
        }
    }
}

fn parse_flag(field: &[u8]) -> Option<bool> {
    match field {
        b"0" => Some(false),
        b"1" => Some(true),
        _ => None,
    }
}

#[doc(hidden)]
pub mod test_support {
    //! Helpers for driving the ask/reply wire exchange from integration
    //! tests without going through a live connection.

    use super::Message;

    /// Stamp a correlation token onto `msg`.
    #[must_use]
    pub fn with_wait(mut msg: Message, token: &str) -> Message {
        msg.wait = token.to_string();
        msg
    }

    /// Read the correlation token off `msg`.
    #[must_use]
    pub fn wait_token(msg: &Message) -> &str { &msg.wait }

    /// Whether deserialisation flagged `msg` as malformed.
    #[must_use]
    pub fn is_invalid(msg: &Message) -> bool { msg.is_invalid }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::{Message, ON_ROOM_JOIN, ON_ROOM_JOINED, ON_ROOM_LEAVE, ON_ROOM_LEFT};
    use crate::error::Error;

    fn sample() -> Message {
        let mut msg = Message::new("chat", "typing", Bytes::from_static(b"alice"));
        msg.room = "lobby".to_string();
        msg.wait = "client_42".to_string();
        msg
    }

    #[rstest]
    fn round_trip_preserves_wire_fields() {
        let msg = sample();
        let decoded = Message::deserialize(&msg.serialize());
        assert_eq!(decoded, msg);
        assert!(!decoded.is_invalid);
    }

    #[rstest]
    fn round_trip_drops_local_flags() {
        let mut msg = sample();
        msg.is_local = true;
        msg.is_forced = true;
        let decoded = Message::deserialize(&msg.serialize());
        assert!(!decoded.is_local);
        assert!(!decoded.is_forced);
    }

    #[rstest]
    fn error_envelope_replaces_body() {
        let mut msg = sample();
        msg.err = Some(Error::BadNamespace);
        let decoded = Message::deserialize(&msg.serialize());
        assert_eq!(decoded.err, Some(Error::BadNamespace));
        assert!(decoded.body.is_empty());
    }

    #[rstest]
    fn body_may_contain_separator() {
        let msg = Message::new("ns", "ev", Bytes::from_static(b"a;b;c"));
        let decoded = Message::deserialize(&msg.serialize());
        assert_eq!(decoded.body, Bytes::from_static(b"a;b;c"));
    }

    #[rstest]
    #[case(b"" as &[u8])]
    #[case(b"too;few;fields")]
    #[case(b";;;;x;0;flag is not 0 or 1")]
    #[case(b";;;;0;2;flag out of range")]
    #[case(b"\xff\xfe;;;ev;0;0;non-utf8 wait")]
    fn malformed_payloads_are_invalid(#[case] payload: &[u8]) {
        assert!(Message::deserialize(payload).is_invalid);
    }

    #[rstest]
    #[case(ON_ROOM_JOIN, true, false)]
    #[case(ON_ROOM_JOINED, true, false)]
    #[case(ON_ROOM_LEAVE, false, true)]
    #[case(ON_ROOM_LEFT, false, true)]
    #[case("chat.message", false, false)]
    fn room_predicates(#[case] event: &str, #[case] join: bool, #[case] left: bool) {
        let msg = Message::new("ns", event, Bytes::new());
        assert_eq!(msg.is_room_join(), join);
        assert_eq!(msg.is_room_left(), left);
    }

    proptest! {
        #[test]
        fn round_trip_any_valid_message(
            namespace in "[A-Za-z0-9_.]{0,16}",
            room in "[A-Za-z0-9_.]{0,16}",
            event in "[A-Za-z0-9_.]{1,24}",
            wait in "(client_)?[0-9]{0,18}",
            body in proptest::collection::vec(any::<u8>(), 0..256),
            is_noop in any::<bool>(),
        ) {
            let msg = Message {
                namespace,
                room,
                event,
                body: Bytes::from(body),
                wait,
                is_noop,
                ..Message::default()
            };
            prop_assert_eq!(Message::deserialize(&msg.serialize()), msg);
        }
    }
}
