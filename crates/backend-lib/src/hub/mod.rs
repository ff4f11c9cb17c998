// ============================
// chathub-backend-lib/src/hub/mod.rs
// ============================
//! Real-time connection hub.
//!
//! The hub is an actor: a [`Registry`] running on its own task, owning the
//! map of connected users, fed through a bounded command queue. A
//! [`HubHandle`] is the only way in. If the registry task panics it is
//! restarted with an empty map; the connections it held see their outbound
//! queues close and shut themselves down.

mod handle;
mod presence;
mod registry;
mod router;

pub use handle::{CloseReason, CloseSignal, ConnectionEndpoint, ConnectionHandle, ConnectionId};
pub use presence::PresenceNotifier;
pub use registry::{HubCommand, Registry};
pub use router::{Delivery, RouteReport, Side};

use crate::config::HubSettings;
use crate::error::AppError;
use crate::metrics::{HUB_RESTARTS, HUB_RETIRE_FAILED, HUB_ROUTE_DROPPED};
use chathub_common::{ChatMessage, ConnectionStatus};
use futures_util::FutureExt;
use metrics::counter;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};

/// Failures submitting a command to the hub
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("connection hub is not running")]
    Unavailable,

    #[error("connection hub did not accept the command within {0:?}")]
    Saturated(Duration),
}

impl From<HubError> for AppError {
    fn from(_: HubError) -> Self {
        AppError::HubUnavailable
    }
}

impl From<oneshot::error::RecvError> for HubError {
    fn from(_: oneshot::error::RecvError) -> Self {
        HubError::Unavailable
    }
}

/// Handle that other components keep to talk to the registry
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    submit_timeout: Duration,
    outbound_capacity: usize,
}

impl HubHandle {
    /// Create both halves of a new connection sized for this hub
    pub fn connection(&self, user_id: &str) -> (ConnectionHandle, ConnectionEndpoint) {
        ConnectionHandle::new(user_id, self.outbound_capacity)
    }

    /// Register a connection; returns once the registry has installed it
    pub async fn admit(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Admit { handle, ack }).await?;
        done.await?;
        Ok(())
    }

    /// Ask the registry to forget a connection, if it is still the current one.
    ///
    /// A failed retire leaves a stale entry behind until a later route to that
    /// user finds its queue closed.
    pub async fn retire(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::Retire {
            user_id: user_id.to_string(),
            connection_id,
        })
        .await
        .inspect_err(|e| {
            counter!(HUB_RETIRE_FAILED).increment(1);
            tracing::warn!(
                user_id = %user_id,
                connection = %connection_id,
                error = %e,
                "failed to retire connection"
            );
        })
    }

    /// Hand a persisted message to the registry for delivery.
    ///
    /// Waits at most the submit timeout for room in the command queue; on
    /// timeout the message is dropped for real-time delivery.
    pub async fn route(&self, message: ChatMessage) -> Result<(), HubError> {
        let sender = message.sender_id.clone();
        let receiver = message.receiver_id.clone();
        self.submit(HubCommand::Route {
            message,
            report: None,
        })
        .await
        .inspect_err(|e| {
            counter!(HUB_ROUTE_DROPPED).increment(1);
            tracing::warn!(
                sender = %sender,
                receiver = %receiver,
                error = %e,
                "message dropped for real-time delivery"
            );
        })
    }

    /// Route and wait for the per-side delivery report
    pub async fn route_with_report(&self, message: ChatMessage) -> Result<RouteReport, HubError> {
        let (report, done) = oneshot::channel();
        self.submit(HubCommand::Route {
            message,
            report: Some(report),
        })
        .await?;
        Ok(done.await?)
    }

    /// Connection count and connected users, as the registry sees them
    pub async fn status(&self) -> Result<ConnectionStatus, HubError> {
        let (reply, done) = oneshot::channel();
        self.submit(HubCommand::Status { reply }).await?;
        Ok(done.await?)
    }

    /// Close every connection and stop the registry
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Shutdown { ack }).await?;
        done.await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn crash(&self) -> Result<(), HubError> {
        self.submit(HubCommand::Crash).await
    }

    async fn submit(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send_timeout(command, self.submit_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => HubError::Saturated(self.submit_timeout),
                SendTimeoutError::Closed(_) => HubError::Unavailable,
            })
    }
}

/// Entry point for starting the hub
pub struct Hub;

impl Hub {
    /// Start the registry under a restarting supervisor.
    ///
    /// The supervisor exits after a shutdown command or once every
    /// [`HubHandle`] has been dropped.
    pub fn spawn(settings: &HubSettings, presence: PresenceNotifier) -> HubHandle {
        let (commands, receiver) = mpsc::channel(settings.command_queue_capacity.max(1));
        tokio::spawn(supervise(receiver, presence));

        HubHandle {
            commands,
            submit_timeout: settings.route_submit_timeout(),
            outbound_capacity: settings.outbound_queue_capacity,
        }
    }
}

async fn supervise(mut commands: mpsc::Receiver<HubCommand>, presence: PresenceNotifier) {
    let mut restarts: u64 = 0;
    loop {
        let mut registry = Registry::new(presence.clone());
        let outcome = AssertUnwindSafe(registry.run(&mut commands))
            .catch_unwind()
            .await;

        match outcome {
            Ok(()) => break,
            Err(panic) => {
                restarts += 1;
                counter!(HUB_RESTARTS).increment(1);
                tracing::error!(
                    restarts,
                    orphaned = registry.len(),
                    panic = panic_message(panic.as_ref()),
                    "connection registry crashed, restarting with an empty map"
                );
                // dropping the old registry closes every outbound queue it held
                drop(registry);
            },
        }
    }
    tracing::info!("connection hub stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
