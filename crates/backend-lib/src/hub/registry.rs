// ============================
// chathub-backend-lib/src/hub/registry.rs
// ============================
//! The connection registry: the single owner of "who is connected now".
//!
//! All state lives in a plain `HashMap` that only the registry task touches.
//! Other tasks talk to it through [`HubCommand`]s, which are processed one at
//! a time in arrival order.

use super::handle::{CloseReason, ConnectionHandle, ConnectionId};
use super::presence::PresenceNotifier;
use super::router::{self, Delivery, RouteReport, Side};
use crate::metrics::{HUB_ADMITTED, HUB_CONNECTIONS, HUB_EVICTED, HUB_RETIRED, HUB_ROUTED};
use chathub_common::{ChatMessage, ConnectionStatus, UserId};
use chrono::Utc;
use metrics::{counter, gauge};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Message sent *into* the registry
#[derive(Debug)]
pub enum HubCommand {
    Admit {
        handle: ConnectionHandle,
        ack: oneshot::Sender<()>,
    },
    Retire {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Route {
        message: ChatMessage,
        report: Option<oneshot::Sender<RouteReport>>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
    #[cfg(test)]
    Crash,
}

pub struct Registry {
    clients: HashMap<UserId, ConnectionHandle>,
    presence: PresenceNotifier,
}

impl Registry {
    pub fn new(presence: PresenceNotifier) -> Self {
        Self {
            clients: HashMap::new(),
            presence,
        }
    }

    /// Install `handle` as the user's connection, evicting any previous one
    pub fn admit(&mut self, handle: ConnectionHandle) {
        let user_id = handle.user_id().to_string();
        let connection_id = handle.id();

        if let Some(previous) = self.clients.remove(&user_id) {
            tracing::info!(
                user_id = %user_id,
                previous = %previous.id(),
                current = %connection_id,
                "user already connected, closing previous connection"
            );
            self.evict(previous, CloseReason::Superseded);
        }

        self.clients.insert(user_id.clone(), handle);
        self.presence.online(&user_id);

        counter!(HUB_ADMITTED).increment(1);
        self.record_size();
        tracing::info!(
            user_id = %user_id,
            connection_id = %connection_id,
            total = self.clients.len(),
            "user connected"
        );
    }

    /// Remove the user's connection if it is still `connection_id`.
    ///
    /// Returns false, changing nothing, when a newer connection has replaced it.
    pub fn retire(&mut self, user_id: &str, connection_id: ConnectionId) -> bool {
        match self.clients.get(user_id) {
            Some(current) if current.id() == connection_id => {},
            _ => {
                tracing::debug!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    "retire ignored, connection is no longer registered"
                );
                return false;
            },
        }

        // dropping the handle closes the outbound queue
        self.clients.remove(user_id);
        self.presence.offline(user_id);

        counter!(HUB_RETIRED).increment(1);
        self.record_size();
        tracing::info!(
            user_id = %user_id,
            connection_id = %connection_id,
            total = self.clients.len(),
            "user disconnected"
        );
        true
    }

    /// Deliver a message to its receiver and, as confirmation, its sender
    pub fn route(&mut self, message: &ChatMessage) -> RouteReport {
        let mut report = RouteReport {
            receiver: Delivery::Offline,
            sender: Delivery::Offline,
        };

        for (side, user_id) in router::recipients(message) {
            let delivery = router::offer(self.clients.get(user_id), message);
            match delivery {
                Delivery::Delivered | Delivery::Offline => {},
                Delivery::Evicted => {
                    if let Some(handle) = self.clients.remove(user_id) {
                        tracing::warn!(
                            user_id = %user_id,
                            connection_id = %handle.id(),
                            "outbound queue full, disconnecting user"
                        );
                        self.evict(handle, CloseReason::Backpressure);
                        self.presence.offline(user_id);
                    }
                },
                Delivery::Stale => {
                    if let Some(handle) = self.clients.remove(user_id) {
                        tracing::debug!(
                            user_id = %user_id,
                            connection_id = %handle.id(),
                            "removing connection whose outbound queue is closed"
                        );
                        self.presence.offline(user_id);
                    }
                },
            }

            counter!(HUB_ROUTED, "side" => side_label(side), "delivery" => delivery_label(delivery))
                .increment(1);
            match side {
                Side::Receiver => report.receiver = delivery,
                Side::Sender => report.sender = delivery,
            }
        }

        if message.sender_id == message.receiver_id {
            report.sender = report.receiver;
        }

        self.record_size();
        tracing::debug!(
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            message_id = %message.id,
            ?report,
            "message routed"
        );
        report
    }

    /// Consistent snapshot of the registered users
    pub fn status(&self) -> ConnectionStatus {
        let mut connected_users: Vec<UserId> = self.clients.keys().cloned().collect();
        connected_users.sort();
        ConnectionStatus {
            total_connections: self.clients.len(),
            connected_users,
            timestamp: Utc::now(),
        }
    }

    /// Connection id currently registered for a user
    pub fn connection_of(&self, user_id: &str) -> Option<ConnectionId> {
        self.clients.get(user_id).map(ConnectionHandle::id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close every registered connection
    pub fn shutdown(&mut self) {
        let count = self.clients.len();
        for (user_id, handle) in self.clients.drain() {
            handle.evict(CloseReason::Shutdown);
            self.presence.offline(&user_id);
        }
        self.record_size();
        tracing::info!(closed = count, "connection registry shut down");
    }

    /// Process commands until shutdown or until every sender is gone
    pub async fn run(&mut self, commands: &mut mpsc::Receiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Admit { handle, ack } => {
                    self.admit(handle);
                    let _ = ack.send(());
                },
                HubCommand::Retire {
                    user_id,
                    connection_id,
                } => {
                    self.retire(&user_id, connection_id);
                },
                HubCommand::Route { message, report } => {
                    let result = self.route(&message);
                    if let Some(report) = report {
                        let _ = report.send(result);
                    }
                },
                HubCommand::Status { reply } => {
                    let _ = reply.send(self.status());
                },
                HubCommand::Shutdown { ack } => {
                    self.shutdown();
                    let _ = ack.send(());
                    return;
                },
                #[cfg(test)]
                HubCommand::Crash => panic!("registry crash requested"),
            }
        }

        self.shutdown();
    }

    fn evict(&self, handle: ConnectionHandle, reason: CloseReason) {
        counter!(HUB_EVICTED, "reason" => reason.as_str()).increment(1);
        handle.evict(reason);
    }

    fn record_size(&self) {
        gauge!(HUB_CONNECTIONS).set(self.clients.len() as f64);
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Receiver => "receiver",
        Side::Sender => "sender",
    }
}

fn delivery_label(delivery: Delivery) -> &'static str {
    match delivery {
        Delivery::Delivered => "delivered",
        Delivery::Offline => "offline",
        Delivery::Evicted => "evicted",
        Delivery::Stale => "stale",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, PresenceStore};
    use chathub_common::{MessageKind, NewMessage};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Registry, Arc<MemoryStorage>) {
        let store = Arc::new(MemoryStorage::new());
        let presence = PresenceNotifier::new(store.clone(), Duration::from_secs(1));
        (Registry::new(presence), store)
    }

    fn message(from: &str, to: &str, content: &str) -> ChatMessage {
        NewMessage {
            sender_id: from.into(),
            receiver_id: to.into(),
            content: content.into(),
            kind: MessageKind::Text,
        }
        .into_message()
    }

    #[tokio::test]
    async fn test_admit_supersedes_previous_connection() {
        let (mut registry, _) = setup();
        let (first, first_end) = ConnectionHandle::new("alice", 8);
        let (second, second_end) = ConnectionHandle::new("alice", 8);
        let (third, third_end) = ConnectionHandle::new("alice", 8);
        let third_id = third.id();

        registry.admit(first);
        registry.admit(second);
        registry.admit(third);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.connection_of("alice"), Some(third_id));
        assert_eq!(first_end.close_reason(), Some(CloseReason::Superseded));
        assert_eq!(second_end.close_reason(), Some(CloseReason::Superseded));
        assert_eq!(third_end.close_reason(), None);
    }

    #[tokio::test]
    async fn test_retire_ignores_superseded_connection() {
        let (mut registry, _) = setup();
        let (first, _first_end) = ConnectionHandle::new("alice", 8);
        let first_id = first.id();
        let (second, _second_end) = ConnectionHandle::new("alice", 8);
        let second_id = second.id();

        registry.admit(first);
        registry.admit(second);

        assert!(!registry.retire("alice", first_id));
        assert_eq!(registry.connection_of("alice"), Some(second_id));

        assert!(registry.retire("alice", second_id));
        assert!(registry.is_empty());
        // retiring twice is a no-op
        assert!(!registry.retire("alice", second_id));
    }

    #[tokio::test]
    async fn test_retire_closes_outbound_queue() {
        let (mut registry, _) = setup();
        let (handle, mut endpoint) = ConnectionHandle::new("alice", 8);
        let id = handle.id();
        registry.admit(handle);
        registry.retire("alice", id);
        assert!(endpoint.next().await.is_none());
        assert_eq!(endpoint.close_reason(), None);
    }

    #[tokio::test]
    async fn test_route_to_both_sides_in_order() {
        let (mut registry, _) = setup();
        let (alice, mut alice_end) = ConnectionHandle::new("alice", 8);
        let (bob, mut bob_end) = ConnectionHandle::new("bob", 8);
        registry.admit(alice);
        registry.admit(bob);

        let sent: Vec<ChatMessage> = ["m1", "m2", "m3"]
            .into_iter()
            .map(|content| message("alice", "bob", content))
            .collect();
        for msg in &sent {
            let report = registry.route(msg);
            assert!(report.delivered_to(Side::Receiver));
            assert!(report.delivered_to(Side::Sender));
        }

        for msg in &sent {
            assert_eq!(bob_end.try_next().as_ref(), Some(msg));
            assert_eq!(alice_end.try_next().as_ref(), Some(msg));
        }
        assert!(bob_end.try_next().is_none());
    }

    #[tokio::test]
    async fn test_route_to_offline_receiver() {
        let (mut registry, _) = setup();
        let (alice, mut alice_end) = ConnectionHandle::new("alice", 8);
        registry.admit(alice);

        let msg = message("alice", "bob", "are you there?");
        let report = registry.route(&msg);
        assert_eq!(report.receiver, Delivery::Offline);
        assert_eq!(report.sender, Delivery::Delivered);
        assert_eq!(alice_end.try_next(), Some(msg));
    }

    #[tokio::test]
    async fn test_full_queue_evicts_recipient() {
        let (mut registry, store) = setup();
        let (alice, mut alice_end) = ConnectionHandle::new("alice", 8);
        let (bob, bob_end) = ConnectionHandle::new("bob", 2);
        registry.admit(alice);
        registry.admit(bob);

        registry.route(&message("alice", "bob", "1"));
        registry.route(&message("alice", "bob", "2"));

        let overflow = message("alice", "bob", "3");
        let report = registry.route(&overflow);
        assert_eq!(report.receiver, Delivery::Evicted);
        // the sender's confirmation is an independent attempt
        assert_eq!(report.sender, Delivery::Delivered);

        assert_eq!(bob_end.close_reason(), Some(CloseReason::Backpressure));
        assert_eq!(registry.connection_of("bob"), None);
        assert_eq!(registry.status().connected_users, vec!["alice".to_string()]);

        let (mut bob_queue, _) = bob_end.into_parts();
        let mut drained = Vec::new();
        while let Some(msg) = bob_queue.recv().await {
            drained.push(msg.content);
        }
        assert_eq!(drained, vec!["1", "2"]);

        let confirmations = std::iter::from_fn(|| alice_end.try_next()).count();
        assert_eq!(confirmations, 3);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let presence = store.presence("bob").await.unwrap().unwrap();
        assert!(!presence.online);
    }

    #[tokio::test]
    async fn test_route_removes_stale_entry() {
        let (mut registry, _) = setup();
        let (bob, bob_end) = ConnectionHandle::new("bob", 2);
        registry.admit(bob);
        drop(bob_end);

        let report = registry.route(&message("alice", "bob", "hi"));
        assert_eq!(report.receiver, Delivery::Stale);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let (mut registry, _) = setup();
        let (bob, bob_end) = ConnectionHandle::new("bob", 2);
        let (alice, alice_end) = ConnectionHandle::new("alice", 2);
        registry.admit(bob);
        registry.admit(alice);

        let status = registry.status();
        assert_eq!(status.total_connections, 2);
        assert_eq!(status.connected_users, vec!["alice", "bob"]);

        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(alice_end.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(bob_end.close_reason(), Some(CloseReason::Shutdown));
    }
}
