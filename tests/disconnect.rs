//! Namespace disconnect protocol: client- and server-initiated teardown,
//! the server-side veto, and `disconnect_all`.

mod common;

use std::sync::{Arc, Mutex};

use eventwire::{Context, Error, Events, Message, Namespaces, ON_NAMESPACE_DISCONNECT};

use crate::common::{eventually, pair};

struct DisconnectProbe {
    seen: Arc<Mutex<Vec<Message>>>,
}

impl DisconnectProbe {
    fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn events(&self) -> Events {
        let seen = Arc::clone(&self.seen);
        Events::new().on(ON_NAMESPACE_DISCONNECT, move |_ns, msg| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().expect("seen lock").push(msg);
                Ok(())
            }
        })
    }

    fn snapshot(&self) -> Vec<Message> { self.seen.lock().expect("seen lock").clone() }
}

#[tokio::test]
async fn client_disconnect_removes_the_namespace_on_both_sides() {
    let server_probe = DisconnectProbe::new();
    let client_probe = DisconnectProbe::new();
    let pair = pair(
        Namespaces::new().namespace("chat", server_probe.events()),
        Namespaces::new().namespace("chat", client_probe.events()),
    )
    .await;

    let ctx = Context::background();
    let ns = pair.client.connect(&ctx, "chat").await.expect("connect");
    ns.disconnect(&ctx).await.expect("disconnect");

    assert!(pair.client.namespace("chat").await.is_none());
    let server_conn = Arc::clone(&pair.server_conn);
    eventually("server to drop chat", move || {
        let server_conn = Arc::clone(&server_conn);
        async move { server_conn.namespace("chat").await.is_none() }
    })
    .await;

    let local = client_probe.snapshot();
    assert_eq!(local.len(), 1);
    assert!(local[0].is_local);
    assert!(!local[0].is_forced);
    assert_eq!(server_probe.snapshot().len(), 1);
}

#[tokio::test]
async fn server_handler_can_refuse_a_disconnect() {
    let veto = Events::new().on(ON_NAMESPACE_DISCONNECT, |_ns, _msg| async {
        Err(Error::event("stay"))
    });
    let pair = pair(
        Namespaces::new().namespace("chat", veto),
        Namespaces::new().namespace("chat", Events::new()),
    )
    .await;

    let ctx = Context::background();
    let ns = pair.client.connect(&ctx, "chat").await.expect("connect");
    let err = ns
        .disconnect(&ctx)
        .await
        .expect_err("server refuses the disconnect");
    assert_eq!(err, Error::Event("stay".to_string()));

    assert!(pair.client.namespace("chat").await.is_some());
    assert!(pair.server_conn.namespace("chat").await.is_some());
}

#[tokio::test]
async fn server_initiated_disconnect_is_final_on_the_client() {
    // A client-side handler error does not keep the namespace alive.
    let failing = Events::new().on(ON_NAMESPACE_DISCONNECT, |_ns, _msg| async {
        Err(Error::event("ignored on the client"))
    });
    let pair = pair(
        Namespaces::new().namespace("chat", Events::new()),
        Namespaces::new().namespace("chat", failing),
    )
    .await;

    let ctx = Context::background();
    let server_ns = pair
        .server_conn
        .connect(&ctx, "chat")
        .await
        .expect("server connect");
    server_ns.disconnect(&ctx).await.expect("server disconnect");

    assert!(pair.server_conn.namespace("chat").await.is_none());
    let client = Arc::clone(&pair.client);
    eventually("client to drop chat", move || {
        let client = Arc::clone(&client);
        async move { client.namespace("chat").await.is_none() }
    })
    .await;
}

#[tokio::test]
async fn disconnect_all_tears_down_every_namespace() {
    let client_probe = DisconnectProbe::new();
    let pair = pair(
        Namespaces::new()
            .namespace("chat", Events::new())
            .namespace("news", Events::new()),
        Namespaces::new()
            .namespace("chat", client_probe.events())
            .namespace("news", client_probe.events()),
    )
    .await;

    let ctx = Context::background();
    pair.client.connect(&ctx, "chat").await.expect("chat");
    pair.client.connect(&ctx, "news").await.expect("news");

    pair.client
        .disconnect_all(&ctx)
        .await
        .expect("disconnect_all");
    assert!(pair.client.namespace("chat").await.is_none());
    assert!(pair.client.namespace("news").await.is_none());

    let fired: Vec<String> = client_probe
        .snapshot()
        .into_iter()
        .map(|msg| msg.namespace)
        .collect();
    assert_eq!(fired.len(), 2);
    assert!(fired.contains(&"chat".to_string()));
    assert!(fired.contains(&"news".to_string()));

    let server_conn = Arc::clone(&pair.server_conn);
    eventually("server to drop both namespaces", move || {
        let server_conn = Arc::clone(&server_conn);
        async move {
            server_conn.namespace("chat").await.is_none()
                && server_conn.namespace("news").await.is_none()
        }
    })
    .await;
}
