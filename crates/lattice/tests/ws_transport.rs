//! WebSocket client/server transports over real loopback sockets: RPC round
//! trip, reply routing between multiple clients, and reconnect exhaustion.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use lattice::transport::{
    ConnectionState, Transport, WsClientConfig, WsClientTransport, WsServerConfig,
    WsServerTransport,
};
use lattice::{CallOptions, Hub, PublishOptions, SubscribeOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_server() -> (Arc<WsServerTransport>, Hub, String) {
    init_logging();
    let transport = Arc::new(WsServerTransport::new(WsServerConfig::new("127.0.0.1:0")));
    transport.initialize().await.unwrap();
    let addr = transport.local_addr().unwrap();

    let hub = Hub::default();
    hub.register_transport(Arc::clone(&transport) as Arc<dyn Transport>);
    (transport, hub, format!("ws://{}", addr))
}

async fn connect_client(url: &str) -> (Arc<WsClientTransport>, Hub) {
    let mut config = WsClientConfig::new(url);
    config.auto_reconnect = false;
    let transport = Arc::new(WsClientTransport::new(config));
    transport.initialize().await.unwrap();

    let hub = Hub::default();
    hub.register_transport(Arc::clone(&transport) as Arc<dyn Transport>);
    (transport, hub)
}

#[tokio::test]
async fn rpc_round_trip_over_websocket() {
    let (_server_transport, server, url) = start_server().await;
    server.handle("session.create", |msg| async move {
        let agent = msg
            .data
            .as_ref()
            .and_then(|d| d.get("agent"))
            .and_then(|a| a.as_str())
            .unwrap_or("unknown")
            .to_string();
        Ok(json!({ "sessionId": "abc", "agent": agent }))
    });

    let (_client_transport, client) = connect_client(&url).await;

    let result = client
        .call(
            "session.create",
            Some(json!({ "agent": "coder" })),
            CallOptions::default(),
        )
        .await
        .unwrap();
    let value = result.unwrap();
    assert_eq!(value["sessionId"], "abc");
    assert_eq!(value["agent"], "coder");
}

#[tokio::test]
async fn responses_route_only_to_the_originating_client() {
    let (_server_transport, server, url) = start_server().await;
    server.handle("agent.status", |_| async { Ok(json!({ "state": "idle" })) });

    let (caller_transport, caller) = connect_client(&url).await;
    let (bystander_transport, _bystander_hub) = connect_client(&url).await;

    let leaked = Arc::new(AtomicUsize::new(0));
    let l = Arc::clone(&leaked);
    let _d = bystander_transport.on_message(Box::new(move |msg| {
        if msg.is_response() {
            l.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let result = caller
        .call("agent.status", None, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result.unwrap()["state"], "idle");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(leaked.load(Ordering::SeqCst), 0);
    drop(caller_transport);
}

#[tokio::test]
async fn events_broadcast_to_all_connected_clients() {
    let (_server_transport, server, url) = start_server().await;

    let seen = Arc::new(AtomicUsize::new(0));
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (transport, hub) = connect_client(&url).await;
        let s = Arc::clone(&seen);
        let d = hub.subscribe(
            "session.deleted",
            move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions::default(),
        );
        clients.push((transport, hub, d));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    server
        .publish("session.deleted", None, PublishOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn reconnect_budget_exhaustion_reaches_terminal_failed_state() {
    init_logging();
    // Nothing listens on this port; every attempt fails fast.
    let mut config = WsClientConfig::new("ws://127.0.0.1:1");
    config.max_reconnect_attempts = 2;
    config.reconnect_base_delay = Duration::from_millis(10);
    config.min_reconnect_delay = Duration::from_millis(5);
    let transport = WsClientTransport::new(config);

    assert!(transport.initialize().await.is_err());

    let mut failed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if transport.state() == ConnectionState::Failed {
            failed = true;
            break;
        }
    }
    assert!(failed, "expected terminal failed state, got {:?}", transport.state());

    // Failed is terminal: initialize refuses until reset.
    assert!(transport.initialize().await.is_err());
    transport.reset_reconnect();
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn server_tracks_connection_count() {
    let (server_transport, _server, url) = start_server().await;
    assert_eq!(server_transport.connection_count(), 0);

    let (client_transport, _hub) = connect_client(&url).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server_transport.connection_count(), 1);

    client_transport.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server_transport.connection_count(), 0);
}
