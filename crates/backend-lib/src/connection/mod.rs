// ============================
// chathub-backend-lib/src/connection/mod.rs
// ============================
//! Per-connection pump.
//!
//! Each accepted connection runs two loops. The inbound loop reads frames,
//! validates and persists messages, then hands them to the hub. The outbound
//! loop owns the write half: it drains the connection's queue and sends
//! liveness pings. Only one task ever writes to a transport.

pub mod transport;

use crate::config::HubSettings;
use crate::hub::{CloseReason, ConnectionId, HubHandle};
use crate::metrics::{MESSAGE_PERSIST_FAILED, MESSAGE_REJECTED, WS_CLOSED};
use crate::validation::validate_send_request;
use crate::AppState;
use chathub_common::{ChatMessage, SendMessageRequest, UserId};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use transport::{Frame, FrameSink, FrameSource};

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Authenticated, not yet admitted by the hub
    Connecting,
    /// Admitted; both loops running
    Registered,
    /// A close reason is known, loops are winding down
    Terminating,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Registered)
                | (Connecting, Terminating)
                | (Registered, Terminating)
                | (Terminating, Closed)
        )
    }
}

struct Lifecycle {
    id: ConnectionId,
    user_id: UserId,
    state: ConnectionState,
}

impl Lifecycle {
    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(
            connection = %self.id,
            user_id = %self.user_id,
            from = ?self.state,
            to = ?next,
            "connection state"
        );
        self.state = next;
    }
}

/// Deadlines and limits the loops run with
#[derive(Debug, Clone, Copy)]
struct Timing {
    ping_interval: Duration,
    write_timeout: Duration,
    ping_write_timeout: Duration,
    read_timeout: Duration,
    store_timeout: Duration,
    max_frame_size: usize,
}

impl From<&HubSettings> for Timing {
    fn from(settings: &HubSettings) -> Self {
        Self {
            ping_interval: settings.ping_interval(),
            write_timeout: settings.write_timeout(),
            ping_write_timeout: settings.ping_write_timeout(),
            read_timeout: settings.read_timeout(),
            store_timeout: settings.store_timeout(),
            max_frame_size: settings.max_frame_size,
        }
    }
}

/// Drive one authenticated connection until it closes, returning why it closed.
///
/// The connection is admitted to the hub first; if the hub is unavailable the
/// transport is closed straight away.
#[tracing::instrument(name = "connection", skip_all, fields(user_id = %user_id))]
pub async fn run_connection<K, S>(
    state: Arc<AppState>,
    user_id: UserId,
    mut sink: K,
    mut source: S,
) -> CloseReason
where
    K: FrameSink,
    S: FrameSource,
{
    let timing = Timing::from(&state.settings.hub);
    let (handle, endpoint) = state.hub.connection(&user_id);
    let mut lifecycle = Lifecycle {
        id: endpoint.id,
        user_id: user_id.clone(),
        state: ConnectionState::Connecting,
    };

    if let Err(e) = state.hub.admit(handle).await {
        tracing::warn!(error = %e, "hub refused connection");
        lifecycle.advance(ConnectionState::Terminating);
        let _ = timeout(timing.write_timeout, sink.send(Frame::Close)).await;
        let _ = sink.close().await;
        lifecycle.advance(ConnectionState::Closed);
        counter!(WS_CLOSED, "reason" => CloseReason::HubUnavailable.as_str()).increment(1);
        return CloseReason::HubUnavailable;
    }
    lifecycle.advance(ConnectionState::Registered);
    tracing::info!(connection = %lifecycle.id, "connection registered");

    let (queue, close) = endpoint.into_parts();
    let mut eviction = close.clone();
    let (stop_tx, stop_rx) = oneshot::channel();
    let (done_tx, mut writer_done) = oneshot::channel();
    let writer = tokio::spawn(async move {
        let reason = write_loop(sink, queue, stop_rx, timing).await;
        let reason = reason.unwrap_or_else(|| close.reason().unwrap_or(CloseReason::HubUnavailable));
        let _ = done_tx.send(reason);
    });

    let reason = loop {
        tokio::select! {
            reason = eviction.closed() => break reason,
            outcome = &mut writer_done => {
                break outcome.unwrap_or(CloseReason::WriteError);
            }
            read = timeout(timing.read_timeout, source.recv()) => {
                let frame = match read {
                    Err(_) => break CloseReason::ProbeTimeout,
                    Ok(None) => break CloseReason::ClientClosed,
                    Ok(Some(Err(e))) => {
                        tracing::debug!(error = %e, "read failed");
                        break CloseReason::ReadError;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };

                let payload = match frame {
                    Frame::Close => break CloseReason::ClientClosed,
                    Frame::Ping(_) | Frame::Pong(_) => continue,
                    Frame::Text(text) => text.into_bytes(),
                    Frame::Binary(data) => data,
                };
                if payload.len() > timing.max_frame_size {
                    break CloseReason::FrameTooLarge;
                }
                let request: SendMessageRequest = match serde_json::from_slice(&payload) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::debug!(error = %e, "undecodable frame");
                        break CloseReason::Malformed;
                    }
                };
                handle_request(&state, &user_id, request, timing.store_timeout).await;
            }
        }
    };
    lifecycle.advance(ConnectionState::Terminating);

    // the writer flushes what is already queued, then closes the transport
    let _ = stop_tx.send(());
    if !reason.is_eviction() {
        // HubHandle::retire logs and counts its own failures
        if state.hub.retire(&user_id, lifecycle.id).await.is_ok() {
            tracing::trace!(connection = %lifecycle.id, "connection retired");
        }
    }
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "outbound loop panicked");
    }

    lifecycle.advance(ConnectionState::Closed);
    counter!(WS_CLOSED, "reason" => reason.as_str()).increment(1);
    tracing::info!(connection = %lifecycle.id, reason = %reason, "connection closed");
    reason
}

/// Validate, persist, then route one inbound request.
/// Failures are logged and the connection keeps going.
async fn handle_request(
    state: &AppState,
    user_id: &str,
    request: SendMessageRequest,
    store_timeout: Duration,
) {
    let new_message = match validate_send_request(user_id, request) {
        Ok(message) => message,
        Err(e) => {
            counter!(MESSAGE_REJECTED, "reason" => e.label()).increment(1);
            tracing::debug!(error = %e, "message rejected");
            return;
        },
    };

    let message = match timeout(store_timeout, state.messages.insert(new_message)).await {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            counter!(MESSAGE_PERSIST_FAILED).increment(1);
            tracing::error!(error = %e, "failed to persist message");
            return;
        },
        Err(_) => {
            counter!(MESSAGE_PERSIST_FAILED).increment(1);
            tracing::error!(timeout = ?store_timeout, "persisting message timed out");
            return;
        },
    };

    state.presence.touch(user_id);
    route(&state.hub, message).await;
}

async fn route(hub: &HubHandle, message: ChatMessage) {
    let id = message.id;
    // HubHandle::route logs and counts drops itself
    if hub.route(message).await.is_ok() {
        tracing::trace!(message_id = %id, "message routed");
    }
}

/// Outbound loop. Returns a reason when the loop decided the close itself;
/// `None` means the queue was closed by the hub or the inbound side stopped it.
async fn write_loop<K: FrameSink>(
    mut sink: K,
    mut queue: mpsc::Receiver<ChatMessage>,
    mut stop: oneshot::Receiver<()>,
    timing: Timing,
) -> Option<CloseReason> {
    let mut ping = interval_at(Instant::now() + timing.ping_interval, timing.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            message = queue.recv() => match message {
                Some(message) => {
                    if !write_message(&mut sink, &message, timing.write_timeout).await {
                        break Some(CloseReason::WriteError);
                    }
                }
                None => break None,
            },
            _ = ping.tick() => {
                match timeout(timing.ping_write_timeout, sink.send(Frame::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break Some(CloseReason::WriteError),
                }
            }
            _ = &mut stop => {
                let mut flushed = true;
                while let Ok(message) = queue.try_recv() {
                    if !write_message(&mut sink, &message, timing.write_timeout).await {
                        flushed = false;
                        break;
                    }
                }
                if !flushed {
                    break Some(CloseReason::WriteError);
                }
                break None;
            }
        }
    };

    if outcome.is_none() {
        let _ = timeout(timing.write_timeout, sink.send(Frame::Close)).await;
    }
    let _ = sink.close().await;
    outcome
}

async fn write_message<K: FrameSink>(sink: &mut K, message: &ChatMessage, deadline: Duration) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(message_id = %message.id, error = %e, "failed to encode message");
            return true;
        },
    };
    match timeout(deadline, sink.send(Frame::Text(text))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "write failed");
            false
        },
        Err(_) => {
            tracing::debug!(timeout = ?deadline, "write timed out");
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use super::transport::memory;
    use super::*;
    use crate::auth::JwtAuthenticator;
    use crate::config::Settings;
    use crate::storage::{MemoryStorage, MessageStore};

    fn app_state(settings: Settings) -> (Arc<AppState>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let state = AppState::new(
            settings,
            Arc::new(JwtAuthenticator::new(b"secret")),
            storage.clone(),
            storage.clone(),
        );
        (Arc::new(state), storage)
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_advance_to(Registered));
        assert!(Connecting.can_advance_to(Terminating));
        assert!(Registered.can_advance_to(Terminating));
        assert!(Terminating.can_advance_to(Closed));

        assert!(!Registered.can_advance_to(Connecting));
        assert!(!Closed.can_advance_to(Registered));
        assert!(!Connecting.can_advance_to(Closed));
    }

    #[tokio::test]
    async fn test_client_close_retires_connection() {
        let (state, _) = app_state(Settings::default());
        let (sink, source, mut remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state.clone(), "alice".into(), sink, source));

        // admitted before any frame is read
        while state.hub.status().await.unwrap().total_connections == 0 {
            tokio::task::yield_now().await;
        }

        remote.send(Frame::Close);
        assert_eq!(pump.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(remote.recv_data().await, Some(Frame::Close));
        assert_eq!(remote.recv().await, None);
        assert_eq!(state.hub.status().await.unwrap().total_connections, 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes() {
        let (state, storage) = app_state(Settings::default());
        let (sink, source, remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state, "alice".into(), sink, source));

        remote.send_text("{not json");
        assert_eq!(pump.await.unwrap(), CloseReason::Malformed);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_message_keeps_connection() {
        let (state, storage) = app_state(Settings::default());
        let (sink, source, mut remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state, "alice".into(), sink, source));

        remote.send_text(r#"{"receiver_id":"bob","content":""}"#);
        remote.send_text(r#"{"receiver_id":"bob","content":"hi","type":"video"}"#);
        remote.send_text(r#"{"receiver_id":"bob","content":"hello"}"#);

        let Some(Frame::Text(text)) = remote.recv_data().await else {
            panic!("expected the sender confirmation");
        };
        let echoed: ChatMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(echoed.content, "hello");
        assert_eq!(storage.len(), 1);

        remote.send(Frame::Close);
        assert_eq!(pump.await.unwrap(), CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn test_null_fields_are_rejected_not_malformed() {
        let (state, storage) = app_state(Settings::default());
        let (sink, source, mut remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state, "alice".into(), sink, source));

        remote.send_text(r#"{"receiver_id":null,"content":"hi"}"#);
        remote.send_text(r#"{"receiver_id":"bob","content":null}"#);
        remote.send_text(r#"{"receiver_id":"bob","content":"still open"}"#);

        let Some(Frame::Text(text)) = remote.recv_data().await else {
            panic!("expected the sender confirmation");
        };
        let echoed: ChatMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(echoed.content, "still open");
        assert_eq!(storage.len(), 1);

        remote.send(Frame::Close);
        assert_eq!(pump.await.unwrap(), CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes() {
        let mut settings = Settings::default();
        settings.hub.max_frame_size = 64;
        let (state, storage) = app_state(settings);
        let (sink, source, remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state, "alice".into(), sink, source));

        let content = "x".repeat(100);
        remote.send_text(format!(r#"{{"receiver_id":"bob","content":"{content}"}}"#));
        assert_eq!(pump.await.unwrap(), CloseReason::FrameTooLarge);
        assert!(storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let mut settings = Settings::default();
        settings.hub.ping_interval_ms = 1_000;
        settings.hub.read_timeout_ms = 3_000;
        let (state, _) = app_state(settings);
        let (sink, source, mut remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state, "alice".into(), sink, source));

        // pings keep coming while nothing is read
        assert!(matches!(remote.recv().await, Some(Frame::Ping(_))));
        assert_eq!(pump.await.unwrap(), CloseReason::ProbeTimeout);
    }

    #[tokio::test]
    async fn test_read_error_closes() {
        let (state, _) = app_state(Settings::default());
        let (sink, source, remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state, "alice".into(), sink, source));

        remote.fail_read("connection reset");
        assert_eq!(pump.await.unwrap(), CloseReason::ReadError);
    }

    #[tokio::test]
    async fn test_hub_unavailable_closes_immediately() {
        let (state, _) = app_state(Settings::default());
        state.hub.shutdown().await.unwrap();
        tokio::task::yield_now().await;

        let (sink, source, mut remote) = memory::pair();
        let reason = run_connection(state, "alice".into(), sink, source).await;
        assert_eq!(reason, CloseReason::HubUnavailable);
        assert_eq!(remote.recv().await, Some(Frame::Close));
        assert_eq!(remote.recv().await, None);
    }

    #[tokio::test]
    async fn test_message_persisted_before_delivery() {
        let (state, storage) = app_state(Settings::default());
        let (sink, source, mut remote) = memory::pair();
        let pump = tokio::spawn(run_connection(state, "alice".into(), sink, source));

        remote.send_text(r#"{"receiver_id":"bob","content":"hi"}"#);
        let Some(Frame::Text(text)) = remote.recv_data().await else {
            panic!("expected the sender confirmation");
        };
        let echoed: ChatMessage = serde_json::from_str(&text).unwrap();
        let stored = storage.conversation("alice", "bob").await.unwrap();
        assert_eq!(stored, vec![echoed]);

        remote.send(Frame::Close);
        pump.await.unwrap();
    }
}
