//! Fire-and-forget presence updates.
use crate::metrics::PRESENCE_FAILURES;
use crate::storage::PresenceStore;
use chrono::Utc;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresenceUpdate {
    Online,
    Offline,
    Touch,
}

impl PresenceUpdate {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Touch => "touch",
        }
    }
}

/// Pushes presence changes to the presence store on detached tasks.
///
/// Nothing waits for these tasks. A failed or timed-out update is logged and
/// counted, never retried.
#[derive(Clone)]
pub struct PresenceNotifier {
    store: Arc<dyn PresenceStore>,
    timeout: Duration,
    failures: Arc<AtomicU64>,
}

impl PresenceNotifier {
    pub fn new(store: Arc<dyn PresenceStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn online(&self, user_id: &str) -> JoinHandle<()> {
        self.spawn(user_id, PresenceUpdate::Online)
    }

    pub fn offline(&self, user_id: &str) -> JoinHandle<()> {
        self.spawn(user_id, PresenceUpdate::Offline)
    }

    /// Refresh last-seen after the user sent something
    pub fn touch(&self, user_id: &str) -> JoinHandle<()> {
        self.spawn(user_id, PresenceUpdate::Touch)
    }

    /// Number of updates that failed since startup
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn spawn(&self, user_id: &str, update: PresenceUpdate) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let failures = Arc::clone(&self.failures);
        let timeout = self.timeout;
        let user_id = user_id.to_string();
        let at = Utc::now();

        tokio::spawn(async move {
            let write = async {
                match update {
                    PresenceUpdate::Online => store.set_online(&user_id, true, at).await,
                    PresenceUpdate::Offline => store.set_online(&user_id, false, at).await,
                    PresenceUpdate::Touch => store.touch_last_seen(&user_id, at).await,
                }
            };

            let error = match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => {
                    tracing::trace!(user_id = %user_id, update = update.as_str(), "presence updated");
                    return;
                },
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {timeout:?}"),
            };

            failures.fetch_add(1, Ordering::Relaxed);
            counter!(PRESENCE_FAILURES, "update" => update.as_str()).increment(1);
            tracing::warn!(
                user_id = %user_id,
                update = update.as_str(),
                error = %error,
                "presence update failed"
            );
        })
    }
}
