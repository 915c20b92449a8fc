//! Shared harness for integration tests: in-memory connection pairs over a
//! duplex transport, plus polling helpers with hard deadlines.
#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use eventwire::{Conn, ConnConfig, FramedSocket, Namespaces, Server};

/// Poll grain for readiness loops.
pub const STEP: Duration = Duration::from_millis(5);
/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(2);

/// An in-memory server/client connection pair.
pub struct Pair {
    pub server: Arc<Server>,
    pub server_conn: Arc<Conn>,
    pub client: Arc<Conn>,
}

/// Build an acknowledged pair with no socket deadlines.
pub async fn pair(server_ns: Namespaces, client_ns: Namespaces) -> Pair {
    pair_with_config(server_ns, client_ns, ConnConfig::default()).await
}

/// Build an acknowledged pair with the given socket deadlines on both ends.
pub async fn pair_with_config(
    server_ns: Namespaces,
    client_ns: Namespaces,
    config: ConnConfig,
) -> Pair {
    let server = Server::new(server_ns, config);
    let (near, far) = tokio::io::duplex(4096);
    let server_conn = server.attach(Arc::new(FramedSocket::new(near)));
    let client = Conn::client(Arc::new(FramedSocket::new(far)), client_ns, config).await;

    eventually("server handshake", || async { server_conn.is_acknowledged() }).await;
    eventually("client handshake", || async { client.is_acknowledged() }).await;

    Pair {
        server,
        server_conn,
        client,
    }
}

/// Poll `cond` until it holds, panicking after [`WAIT`].
pub async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(STEP).await;
    }
}
