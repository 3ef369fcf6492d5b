//! Server-side connection registry and room membership index.
//!
//! The router tracks abstract [`ClientConnection`] handles (not tied to any
//! one transport) and a bidirectional rooms index: room -> members plus a
//! reverse client -> rooms map, so disconnect cleanup is bounded by the
//! departing client's own membership rather than the whole registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use serde::Serialize;

use lattice_protocol::{GLOBAL_ROOM, HubMessage, encode};

use crate::error::HubError;

// ============================================================================
// Client connections
// ============================================================================

/// Abstract handle to one connected peer.
///
/// Owned by whichever transport created it; registered into and removed from
/// the router explicitly.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Stable connection id; doubles as the router client id.
    fn id(&self) -> &str;

    /// Deliver one already-serialized message.
    async fn send(&self, payload: &str) -> Result<(), HubError>;

    fn is_open(&self) -> bool;

    /// Backpressure valve: `false` means the connection cannot take more
    /// data right now and deliveries should be skipped, not buffered.
    fn can_accept(&self) -> bool {
        true
    }
}

/// Registry record for one client.
#[derive(Clone)]
pub struct ClientInfo {
    pub client_id: String,
    pub connection: Arc<dyn ClientConnection>,
    pub connected_at: DateTime<Utc>,
}

// ============================================================================
// Delivery reports
// ============================================================================

/// Outcome of a room-scoped routing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    pub sent: usize,
    pub failed: usize,
    pub total_subscribers: usize,
    pub session_id: String,
    pub method: String,
}

/// Outcome of a registry-wide broadcast.
///
/// `skipped` counts backpressured connections and is disjoint from `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

// ============================================================================
// Router
// ============================================================================

/// Bidirectional room membership maps. Both sides are always mutated under
/// the same lock, together with the registry membership check, so the
/// registry and the index cannot drift apart under concurrent join/unregister.
#[derive(Default)]
struct RoomIndex {
    /// room -> member client ids
    rooms: HashMap<String, HashSet<String>>,
    /// client id -> joined rooms (reverse index for O(1) disconnect cleanup)
    client_rooms: HashMap<String, HashSet<String>>,
}

impl RoomIndex {
    fn remove_membership(&mut self, client_id: &str, room: &str) {
        let now_empty = self
            .rooms
            .get_mut(room)
            .map(|members| {
                members.remove(client_id);
                members.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            self.rooms.remove(room);
        }
    }
}

/// Connection registry + room membership index with broadcast/route ops.
pub struct Router {
    clients: DashMap<String, ClientInfo>,
    index: Mutex<RoomIndex>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            index: Mutex::new(RoomIndex::default()),
        }
    }

    // -- Registry --

    /// Register a connection and auto-join it to the `"global"` room.
    ///
    /// Idempotent: re-registering a connection with the same id returns the
    /// existing client id without creating a duplicate entry.
    pub fn register_connection(&self, connection: Arc<dyn ClientConnection>) -> String {
        let client_id = connection.id().to_string();
        match self.clients.entry(client_id.clone()) {
            Entry::Occupied(_) => {
                debug!("Connection {} already registered", client_id);
                return client_id;
            }
            Entry::Vacant(slot) => {
                slot.insert(ClientInfo {
                    client_id: client_id.clone(),
                    connection,
                    connected_at: Utc::now(),
                });
            }
        }
        self.join_room(&client_id, GLOBAL_ROOM);
        info!("Registered client {}", client_id);
        client_id
    }

    /// Remove a client from the registry and from every room it had joined.
    /// No-op for unknown ids.
    ///
    /// The registry entry goes first, so a `join_room` racing this call
    /// either sees the client gone or has its insert purged below.
    pub fn unregister_connection(&self, client_id: &str) {
        if self.clients.remove(client_id).is_none() {
            return;
        }

        // Reverse index bounds the purge to this client's own rooms.
        let mut index = self.index.lock().unwrap();
        if let Some(rooms) = index.client_rooms.remove(client_id) {
            for room in rooms {
                index.remove_membership(client_id, &room);
            }
        }
        drop(index);

        info!("Unregistered client {}", client_id);
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // -- Rooms --

    /// Join a registered client to a room. Unknown clients log a warning and
    /// are otherwise a no-op.
    pub fn join_room(&self, client_id: &str, room: &str) {
        // The registration check and both index inserts happen under the
        // index lock; see unregister_connection for the other side.
        let mut index = self.index.lock().unwrap();
        if !self.clients.contains_key(client_id) {
            warn!("Cannot join room '{}': unknown client {}", room, client_id);
            return;
        }
        index
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(client_id.to_string());
        index
            .client_rooms
            .entry(client_id.to_string())
            .or_default()
            .insert(room.to_string());
        debug!("Client {} joined room '{}'", client_id, room);
    }

    pub fn leave_room(&self, client_id: &str, room: &str) {
        let mut index = self.index.lock().unwrap();
        index.remove_membership(client_id, room);
        let now_empty = index
            .client_rooms
            .get_mut(client_id)
            .map(|rooms| {
                rooms.remove(room);
                rooms.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            index.client_rooms.remove(client_id);
        }
        debug!("Client {} left room '{}'", client_id, room);
    }

    /// Member ids of a room (empty for unknown rooms).
    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.index
            .lock()
            .unwrap()
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a client has joined.
    pub fn rooms_of(&self, client_id: &str) -> Vec<String> {
        self.index
            .lock()
            .unwrap()
            .client_rooms
            .get(client_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -- Delivery --

    /// Fan an event out to every member of `message.room` (default
    /// `"global"`). The message is serialized once; each member delivery is
    /// isolated, so one failure cannot abort the rest.
    pub async fn route_event_to_room(&self, message: &HubMessage) -> RouteReport {
        let room = message.room_or_global();
        let members = self.room_members(room);

        let mut report = RouteReport {
            sent: 0,
            failed: 0,
            total_subscribers: members.len(),
            session_id: message.session_id.clone(),
            method: message.method.clone(),
        };

        let payload = match encode(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("Cannot serialize event '{}' for room '{}': {}", message.method, room, e);
                report.failed = report.total_subscribers;
                return report;
            }
        };

        for client_id in members {
            let Some(connection) = self.connection_of(&client_id) else {
                report.failed += 1;
                continue;
            };
            if !connection.is_open() {
                report.failed += 1;
                continue;
            }
            match connection.send(&payload).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!("Failed to route '{}' to client {}: {}", message.method, client_id, e);
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Routed '{}' to room '{}': sent={} failed={}",
            report.method, room, report.sent, report.failed
        );
        report
    }

    /// Deliver to every registered connection, ignoring room scope.
    ///
    /// Connections reporting `can_accept() == false` are skipped (counted
    /// separately from failures) rather than buffered.
    pub async fn broadcast(&self, message: &HubMessage) -> BroadcastReport {
        let connections: Vec<Arc<dyn ClientConnection>> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(&entry.value().connection))
            .collect();

        let mut report = BroadcastReport::default();

        let payload = match encode(message) {
            Ok(p) => p,
            Err(e) => {
                warn!("Cannot serialize broadcast '{}': {}", message.method, e);
                report.failed = connections.len();
                return report;
            }
        };

        for connection in connections {
            if !connection.can_accept() {
                report.skipped += 1;
                continue;
            }
            if !connection.is_open() {
                report.failed += 1;
                continue;
            }
            match connection.send(&payload).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!("Broadcast to client {} failed: {}", connection.id(), e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn connection_of(&self, client_id: &str) -> Option<Arc<dyn ClientConnection>> {
        self.clients
            .get(client_id)
            .map(|info| Arc::clone(&info.connection))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted connection for registry and delivery tests.
    struct MockConnection {
        id: String,
        open: AtomicBool,
        accept: AtomicBool,
        fail_sends: bool,
        sent: Mutex<Vec<String>>,
    }

    impl MockConnection {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                open: AtomicBool::new(true),
                accept: AtomicBool::new(true),
                fail_sends: false,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                open: AtomicBool::new(true),
                accept: AtomicBool::new(true),
                fail_sends: true,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ClientConnection for MockConnection {
        fn id(&self) -> &str {
            &self.id
        }

        async fn send(&self, payload: &str) -> Result<(), HubError> {
            if self.fail_sends {
                return Err(HubError::Transport("scripted failure".to_string()));
            }
            self.sent.lock().unwrap().push(payload.to_string());
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn can_accept(&self) -> bool {
            self.accept.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let router = Router::new();
        let conn = MockConnection::new("c1");
        let id1 = router.register_connection(conn.clone());
        let id2 = router.register_connection(conn);
        assert_eq!(id1, id2);
        assert_eq!(router.client_count(), 1);
    }

    #[test]
    fn test_register_auto_joins_global_room() {
        let router = Router::new();
        router.register_connection(MockConnection::new("c1"));
        assert_eq!(router.room_members(GLOBAL_ROOM), vec!["c1".to_string()]);
        assert_eq!(router.rooms_of("c1"), vec![GLOBAL_ROOM.to_string()]);
    }

    #[test]
    fn test_unregister_purges_all_rooms() {
        let router = Router::new();
        router.register_connection(MockConnection::new("c1"));
        router.join_room("c1", "ops");
        router.join_room("c1", "builds");

        router.unregister_connection("c1");

        assert!(!router.is_registered("c1"));
        assert!(router.rooms_of("c1").is_empty());
        assert!(router.room_members("ops").is_empty());
        assert!(router.room_members("builds").is_empty());
        assert!(router.room_members(GLOBAL_ROOM).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_and_unregister_leave_no_ghost_membership() {
        for _ in 0..50 {
            let router = Arc::new(Router::new());
            router.register_connection(MockConnection::new("c1"));

            let joiner = Arc::clone(&router);
            let join_task = tokio::spawn(async move {
                for i in 0..50 {
                    joiner.join_room("c1", &format!("room{}", i % 4));
                    tokio::task::yield_now().await;
                }
            });
            let dropper = Arc::clone(&router);
            let drop_task = tokio::spawn(async move {
                tokio::task::yield_now().await;
                dropper.unregister_connection("c1");
            });
            join_task.await.unwrap();
            drop_task.await.unwrap();

            // Joins that lost the race must not leave index entries behind.
            assert!(!router.is_registered("c1"));
            assert!(router.rooms_of("c1").is_empty());
            for i in 0..4 {
                assert!(router.room_members(&format!("room{}", i)).is_empty());
            }
            assert!(router.room_members(GLOBAL_ROOM).is_empty());
        }
    }

    #[test]
    fn test_unregister_unknown_client_is_noop() {
        let router = Router::new();
        router.unregister_connection("ghost");
        assert_eq!(router.client_count(), 0);
    }

    #[test]
    fn test_join_room_unknown_client_is_noop() {
        let router = Router::new();
        router.join_room("ghost", "ops");
        assert!(router.room_members("ops").is_empty());
    }

    #[tokio::test]
    async fn test_route_event_to_room_members_only() {
        let router = Router::new();
        let a = MockConnection::new("a");
        let b = MockConnection::new("b");
        let c = MockConnection::new("c");
        router.register_connection(a.clone());
        router.register_connection(b.clone());
        router.register_connection(c.clone());
        // c leaves the global room beforehand.
        router.leave_room("c", GLOBAL_ROOM);

        let event = HubMessage::event("session.deleted", "global", None);
        let report = router.route_event_to_room(&event).await;

        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total_subscribers, 2);
        assert_eq!(report.method, "session.deleted");
        assert_eq!(a.sent_count(), 1);
        assert_eq!(b.sent_count(), 1);
        assert_eq!(c.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_route_event_isolates_member_failures() {
        let router = Router::new();
        let good = MockConnection::new("good");
        router.register_connection(MockConnection::failing("bad"));
        router.register_connection(good.clone());

        let event = HubMessage::event("session.deleted", "global", None);
        let report = router.route_event_to_room(&event).await;

        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(good.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_counts_skipped_separately() {
        let router = Router::new();
        let a = MockConnection::new("a");
        let b = MockConnection::new("b");
        let c = MockConnection::new("c");
        router.register_connection(a.clone());
        router.register_connection(b.clone());
        router.register_connection(c.clone());
        // b is backpressured, c's socket already closed.
        b.accept.store(false, Ordering::SeqCst);
        c.open.store(false, Ordering::SeqCst);

        let msg = HubMessage::event("system.notice", "global", None);
        let report = router.broadcast(&msg).await;

        assert_eq!(report.sent, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(a.sent_count(), 1);
        assert_eq!(b.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_send_error_does_not_propagate() {
        let router = Router::new();
        router.register_connection(MockConnection::new("a"));
        router.register_connection(MockConnection::new("b"));
        router.register_connection(MockConnection::failing("x"));

        let msg = HubMessage::event("system.notice", "global", None);
        let report = router.broadcast(&msg).await;

        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_serialization_failure_counts_all_failed() {
        let router = Router::new();
        router.register_connection(MockConnection::new("a"));
        router.register_connection(MockConnection::new("b"));

        // Invalid method name fails wire validation before any delivery.
        let mut msg = HubMessage::event("session.deleted", "global", None);
        msg.method = "not-a-valid-method".to_string();

        let report = router.broadcast(&msg).await;
        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, 2);

        let report = router.route_event_to_room(&msg).await;
        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, report.total_subscribers);
    }
}
