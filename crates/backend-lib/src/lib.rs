// ============================
// chathub-backend-lib/src/lib.rs
// ============================
//! Core backend functionality for the chathub real-time messaging server.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod storage;
pub mod validation;
pub mod ws_router;

use crate::auth::Authenticator;
use crate::config::Settings;
use crate::connection::run_connection;
use crate::connection::transport::{FrameSink, FrameSource};
use crate::hub::{CloseReason, Hub, HubHandle, PresenceNotifier};
use crate::storage::{MessageStore, PresenceStore};
use chathub_common::UserId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Credential verifier
    pub auth: Arc<dyn Authenticator>,
    /// Store of record for messages
    pub messages: Arc<dyn MessageStore>,
    /// Best-effort presence updates
    pub presence: PresenceNotifier,
    /// Handle to the connection registry
    pub hub: HubHandle,
    /// Every running connection pump
    pub connections: TaskTracker,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Create the application state and start the connection hub.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: Settings,
        auth: Arc<dyn Authenticator>,
        messages: Arc<dyn MessageStore>,
        presence_store: Arc<dyn PresenceStore>,
    ) -> Self {
        let presence = PresenceNotifier::new(presence_store, settings.hub.presence_timeout());
        let hub = Hub::spawn(&settings.hub, presence.clone());

        Self {
            auth,
            messages,
            presence,
            hub,
            connections: TaskTracker::new(),
            settings: Arc::new(settings),
        }
    }

    /// The connection pump for `user_id`, tracked so shutdown can wait for it
    pub fn track_connection<K, S>(
        self: &Arc<Self>,
        user_id: UserId,
        sink: K,
        source: S,
    ) -> impl Future<Output = CloseReason> + Send + 'static
    where
        K: FrameSink,
        S: FrameSource,
    {
        self.connections
            .track_future(run_connection(Arc::clone(self), user_id, sink, source))
    }

    /// Wait up to `grace` for every tracked pump to finish closing.
    /// Returns false if some were still running when the grace period ran out.
    pub async fn drain_connections(&self, grace: Duration) -> bool {
        self.connections.close();
        match tokio::time::timeout(grace, self.connections.wait()).await {
            Ok(()) => {
                tracing::info!("all connections closed");
                true
            },
            Err(_) => {
                tracing::warn!(
                    remaining = self.connections.len(),
                    grace = ?grace,
                    "connections still open after the shutdown grace period"
                );
                false
            },
        }
    }
}
