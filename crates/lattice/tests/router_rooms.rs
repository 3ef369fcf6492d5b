//! Daemon glue: WebSocket server connections registered into a router, with
//! room-scoped event routing delivered over real loopback sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use lattice::protocol::{GLOBAL_ROOM, HubMessage};
use lattice::transport::{Transport, WsClientConfig, WsClientTransport, WsServerConfig, WsServerTransport};
use lattice::Router;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Peer {
    transport: Arc<WsClientTransport>,
    received: Arc<AtomicUsize>,
    _wiring: lattice::Disposer,
}

async fn connect_peer(url: &str, method: &'static str) -> Peer {
    let mut config = WsClientConfig::new(url);
    config.auto_reconnect = false;
    let transport = Arc::new(WsClientTransport::new(config));
    transport.initialize().await.unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let wiring = transport.on_message(Box::new(move |msg| {
        if msg.method == method {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));
    Peer {
        transport,
        received,
        _wiring: wiring,
    }
}

#[tokio::test]
async fn room_scoped_events_reach_members_only() {
    init_logging();
    let server = WsServerTransport::new(WsServerConfig::new("127.0.0.1:0"));
    server.initialize().await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());

    let router = Arc::new(Router::new());

    // Every accepted connection lands in the registry (and the global room).
    let reg = Arc::clone(&router);
    let _on_connect = server.on_connection(move |conn| {
        reg.register_connection(Arc::clone(conn) as Arc<dyn lattice::ClientConnection>);
    });
    let unreg = Arc::clone(&router);
    let _on_disconnect = server.on_disconnect(move |client_id| {
        unreg.unregister_connection(client_id);
    });

    let in_room = connect_peer(&url, "agent.output").await;
    let outside = connect_peer(&url, "agent.output").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(router.client_count(), 2);

    // Put exactly one of the two clients into the ops room.
    let members = router.room_members(GLOBAL_ROOM);
    assert_eq!(members.len(), 2);
    router.join_room(&members[0], "ops");

    let event = HubMessage::event("agent.output", "abc", Some(json!({ "line": "hi" })))
        .with_room("ops");
    let report = router.route_event_to_room(&event).await;
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.total_subscribers, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        in_room.received.load(Ordering::SeqCst) + outside.received.load(Ordering::SeqCst),
        1,
        "exactly one peer should have received the room event"
    );

    // Global-room routing (no room on the message) reaches both.
    let event = HubMessage::event("agent.output", "abc", None);
    let report = router.route_event_to_room(&event).await;
    assert_eq!(report.sent, 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        in_room.received.load(Ordering::SeqCst) + outside.received.load(Ordering::SeqCst),
        3
    );
}

#[tokio::test]
async fn disconnect_unregisters_and_leaves_rooms() {
    init_logging();
    let server = WsServerTransport::new(WsServerConfig::new("127.0.0.1:0"));
    server.initialize().await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());

    let router = Arc::new(Router::new());
    let reg = Arc::clone(&router);
    let _on_connect = server.on_connection(move |conn| {
        let id = reg.register_connection(Arc::clone(conn) as Arc<dyn lattice::ClientConnection>);
        reg.join_room(&id, "ops");
    });
    let unreg = Arc::clone(&router);
    let _on_disconnect = server.on_disconnect(move |client_id| {
        unreg.unregister_connection(client_id);
    });

    let peer = connect_peer(&url, "agent.output").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(router.client_count(), 1);
    assert_eq!(router.room_members("ops").len(), 1);

    peer.transport.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(router.client_count(), 0);
    assert!(router.room_members("ops").is_empty());
    assert!(router.room_members(GLOBAL_ROOM).is_empty());
}
