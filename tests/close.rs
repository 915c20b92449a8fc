//! Connection teardown: forced disconnects, idempotent close, and the
//! manual-close handler sentinel.

mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use eventwire::{
    ConnConfig, Context, Error, Events, Message, Namespaces, ON_NAMESPACE_DISCONNECT,
};

use crate::common::{eventually, pair_with_config};

#[tokio::test]
async fn peer_close_forces_a_local_disconnect_exactly_once() {
    let forced: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let client_events = Events::new().on(ON_NAMESPACE_DISCONNECT, {
        let forced = Arc::clone(&forced);
        move |_ns, msg| {
            let forced = Arc::clone(&forced);
            async move {
                forced.lock().expect("forced lock").push(msg);
                Ok(())
            }
        }
    });
    let config = ConnConfig {
        read_timeout: Some(Duration::from_millis(200)),
        write_timeout: None,
    };
    let pair = pair_with_config(
        Namespaces::new().namespace("chat", Events::new()),
        Namespaces::new().namespace("chat", client_events),
        config,
    )
    .await;

    let ctx = Context::background();
    pair.client.connect(&ctx, "chat").await.expect("connect");

    pair.server_conn.close().await;

    // The client reader notices within one read timeout and tears down.
    let client = Arc::clone(&pair.client);
    eventually("client to close", move || {
        let client = Arc::clone(&client);
        async move { client.is_closed() }
    })
    .await;

    {
        let forced = forced.lock().expect("forced lock");
        assert_eq!(forced.len(), 1);
        assert!(forced[0].is_forced);
        assert!(forced[0].is_local);
        assert_eq!(forced[0].namespace, "chat");
    }
    assert!(!pair.client.write(Message::new("chat", "typing", Bytes::new())).await);
    assert!(pair.client.namespace("chat").await.is_none());
    assert!(!pair.client.is_acknowledged());

    // Close is latched: a second call must not re-fire the disconnect.
    pair.client.close().await;
    assert_eq!(forced.lock().expect("forced lock").len(), 1);
}

#[tokio::test]
async fn manual_close_error_replies_then_closes_the_connection() {
    let kill = Events::new().on("kill", |_ns, _msg| async {
        Err(Error::close(1008, "policy"))
    });
    let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let client_events = Events::new().on("kill", {
        let received = Arc::clone(&received);
        move |_ns, msg| {
            let received = Arc::clone(&received);
            async move {
                received.lock().expect("received lock").push(msg);
                Ok(())
            }
        }
    });
    let config = ConnConfig {
        read_timeout: Some(Duration::from_millis(200)),
        write_timeout: None,
    };
    let pair = pair_with_config(
        Namespaces::new().namespace("chat", kill),
        Namespaces::new().namespace("chat", client_events),
        config,
    )
    .await;

    let ctx = Context::background();
    let ns = pair.client.connect(&ctx, "chat").await.expect("connect");
    assert!(ns.emit("kill", Bytes::new()).await);

    // The handler's sentinel is written back before the reader stops.
    let received_clone = Arc::clone(&received);
    eventually("error reply to arrive", move || {
        let received = Arc::clone(&received_clone);
        async move { !received.lock().expect("received lock").is_empty() }
    })
    .await;
    assert_eq!(
        received.lock().expect("received lock")[0].err,
        Some(Error::close(1008, "policy"))
    );

    let server_conn = Arc::clone(&pair.server_conn);
    eventually("server to close", move || {
        let server_conn = Arc::clone(&server_conn);
        async move { server_conn.is_closed() }
    })
    .await;
    let client = Arc::clone(&pair.client);
    eventually("client to follow", move || {
        let client = Arc::clone(&client);
        async move { client.is_closed() }
    })
    .await;
}

#[tokio::test]
async fn server_close_shuts_down_accepting_and_connections() {
    let pair = pair_with_config(
        Namespaces::new().namespace("chat", Events::new()),
        Namespaces::new().namespace("chat", Events::new()),
        ConnConfig {
            read_timeout: Some(Duration::from_millis(200)),
            write_timeout: None,
        },
    )
    .await;

    pair.server.close().await;
    assert!(pair.server_conn.is_closed());

    let client = Arc::clone(&pair.client);
    eventually("client to close", move || {
        let client = Arc::clone(&client);
        async move { client.is_closed() }
    })
    .await;
}

#[tokio::test]
async fn wait_close_resolves_on_close() {
    let pair = pair_with_config(
        Namespaces::new(),
        Namespaces::new(),
        ConnConfig::default(),
    )
    .await;

    let waiter = {
        let client = Arc::clone(&pair.client);
        tokio::spawn(async move {
            client.wait_close().await;
        })
    };
    pair.client.close().await;
    tokio::time::timeout(common::WAIT, waiter)
        .await
        .expect("wait_close resolves")
        .expect("join");
}
