//! Shared setup for the backend integration tests.
#![allow(dead_code)]

use chathub_backend::auth::{Claims, JwtAuthenticator};
use chathub_backend::config::Settings;
use chathub_backend::connection::transport::memory::{self, Remote};
use chathub_backend::connection::transport::{Frame, FrameSink, FrameSource};
use chathub_backend::hub::CloseReason;
use chathub_backend::storage::{MemoryStorage, MessageStore, PresenceStore};
use chathub_backend::AppState;
use chathub_common::ChatMessage;
use jsonwebtoken::{encode, EncodingKey, Header};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const SECRET: &[u8] = b"integration-secret";

pub fn token(user_id: &str) -> String {
    let claims = Claims {
        user_id: Some(user_id.to_string()),
        sub: None,
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

pub fn state_with<T>(settings: Settings, storage: Arc<T>) -> Arc<AppState>
where
    T: MessageStore + PresenceStore + 'static,
{
    let messages: Arc<dyn MessageStore> = storage.clone();
    let presence: Arc<dyn PresenceStore> = storage;
    Arc::new(AppState::new(
        settings,
        Arc::new(JwtAuthenticator::new(SECRET)),
        messages,
        presence,
    ))
}

pub fn memory_state(settings: Settings) -> (Arc<AppState>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    (state_with(settings, storage.clone()), storage)
}

/// A connected client driven through the in-memory transport
pub struct Client {
    pub remote: Remote,
    pub pump: JoinHandle<CloseReason>,
}

impl Client {
    pub fn say(&self, to: &str, content: &str) {
        let frame = serde_json::json!({ "receiver_id": to, "content": content, "type": "text" });
        assert!(self.remote.send_text(frame.to_string()));
    }

    /// Next delivered message, skipping pings
    pub async fn next_message(&mut self) -> ChatMessage {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.remote.recv_data())
            .await
            .expect("no frame within 5s");
        match frame {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a message frame, got {other:?}"),
        }
    }

    pub async fn close(self) -> CloseReason {
        self.remote.send(Frame::Close);
        self.pump.await.unwrap()
    }
}

/// Start a pump for `user_id` and wait until the hub has admitted it
pub async fn connect(state: &Arc<AppState>, user_id: &str) -> Client {
    let (sink, source, remote) = memory::pair();
    let pump = spawn_pump(state, user_id, sink, source);
    wait_for_user(state, user_id).await;
    Client { remote, pump }
}

pub fn spawn_pump<K: FrameSink, S: FrameSource>(
    state: &Arc<AppState>,
    user_id: &str,
    sink: K,
    source: S,
) -> JoinHandle<CloseReason> {
    tokio::spawn(state.track_connection(user_id.to_string(), sink, source))
}

pub async fn wait_for_user(state: &Arc<AppState>, user_id: &str) {
    for _ in 0..1000 {
        let status = state.hub.status().await.unwrap();
        if status.connected_users.iter().any(|u| u == user_id) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("{user_id} was never admitted");
}
