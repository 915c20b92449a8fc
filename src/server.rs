//! Server-side ownership of accepted connections.
//!
//! A [`Server`] holds the declared namespaces, assigns identities, and keeps
//! a registry of live connections. Closed connections announce themselves on
//! the server's disconnect channel and a background task prunes them from
//! the registry. The accept loop is deliberately a thin shell: anything that
//! can produce a [`Socket`] (a TCP listener here, a websocket upgrade
//! elsewhere) hands connections in through [`Server::attach`].

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    conn::{Conn, ConnConfig, ServerRef},
    message::Message,
    namespaces::Namespaces,
    socket::{FramedSocket, Socket},
};

/// Pluggable connection identity source.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Accepts, registers, and deregisters server-side connections.
pub struct Server {
    weak: std::sync::Weak<Server>,
    namespaces: Arc<Namespaces>,
    config: ConnConfig,
    id_gen: IdGenerator,
    connections: DashMap<String, Arc<Conn>>,
    disconnect: mpsc::UnboundedSender<Arc<Conn>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Build a server with counter-based connection identities.
    #[must_use]
    pub fn new(namespaces: Namespaces, config: ConnConfig) -> Arc<Self> {
        let seq = AtomicU64::new(0);
        Self::with_id_generator(
            namespaces,
            config,
            Arc::new(move || format!("conn.{}", seq.fetch_add(1, Ordering::Relaxed) + 1)),
        )
    }

    /// Build a server with a custom identity source.
    #[must_use]
    pub fn with_id_generator(
        namespaces: Namespaces,
        config: ConnConfig,
        id_gen: IdGenerator,
    ) -> Arc<Self> {
        let (disconnect, disconnected) = mpsc::unbounded_channel();
        let server = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            namespaces: Arc::new(namespaces),
            config,
            id_gen,
            connections: DashMap::new(),
            disconnect,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(Self::reap_disconnects(
            Arc::downgrade(&server),
            disconnected,
        ));
        server
    }

    /// Deregister connections as they announce their close.
    async fn reap_disconnects(
        server: std::sync::Weak<Server>,
        mut disconnected: mpsc::UnboundedReceiver<Arc<Conn>>,
    ) {
        while let Some(conn) = disconnected.recv().await {
            let Some(server) = server.upgrade() else {
                break;
            };
            server.connections.remove(conn.id());
            log::debug!("conn {}: deregistered", conn.id());
        }
    }

    /// Adopt `socket` as a new server-side connection: assign an identity,
    /// register it, and start its reader. The handshake completes on the
    /// reader once the client opens it.
    pub fn attach(&self, socket: Arc<dyn Socket>) -> Arc<Conn> {
        let id = (self.id_gen)();
        let conn = Conn::new(
            socket,
            Arc::clone(&self.namespaces),
            Some(ServerRef {
                server: self.weak.clone(),
                disconnect: self.disconnect.clone(),
            }),
            self.config,
        );
        conn.set_id(id.clone());
        self.connections.insert(id, Arc::clone(&conn));
        tokio::spawn(Arc::clone(&conn).run_reader());
        conn
    }

    /// Accept TCP connections until [`Server::close`] is called.
    ///
    /// # Errors
    ///
    /// Reserved for listener-level failures; per-connection accept
    /// failures are logged and retried.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("accepted connection from {addr}");
                        self.attach(Arc::new(FramedSocket::new(stream)));
                    }
                    Err(err) => log::warn!("accept failed: {err}"),
                },
            }
        }
    }

    /// The registered connection with identity `id`, if still live.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Conn>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize { self.connections.len() }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.connections.is_empty() }

    /// Best-effort fan-out of `msg` to every acknowledged connection,
    /// optionally excluding one identity (typically the originator).
    pub async fn broadcast(&self, exclude: Option<&str>, msg: Message) {
        let conns: Vec<Arc<Conn>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in conns {
            if exclude.is_some_and(|id| id == conn.id()) || !conn.is_acknowledged() {
                continue;
            }
            conn.write(msg.clone()).await;
        }
    }

    /// Stop accepting and close every registered connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let conns: Vec<Arc<Conn>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in conns {
            conn.close().await;
        }
    }
}
