//! Routing and backpressure policy.
//!
//! Delivery is local to this process: a message goes to the receiver's
//! connection (the actual message) and to the sender's connection (the send
//! confirmation), each as an independent non-blocking attempt. The outbound
//! queue capacity is the only backpressure knob; a recipient whose queue is
//! full is not waited for, it is evicted.

use super::handle::ConnectionHandle;
use chathub_common::ChatMessage;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;

/// Which side of a message a recipient is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Receiver,
    Sender,
}

/// Outcome of offering a message to one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Enqueued on the recipient's outbound queue
    Delivered,
    /// No connection registered for the recipient
    Offline,
    /// Outbound queue was full; the connection must be evicted
    Evicted,
    /// Outbound queue was already closed; the entry is stale
    Stale,
}

/// Per-side result of one route command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    pub receiver: Delivery,
    pub sender: Delivery,
}

impl RouteReport {
    pub fn delivered_to(&self, side: Side) -> bool {
        match side {
            Side::Receiver => self.receiver == Delivery::Delivered,
            Side::Sender => self.sender == Delivery::Delivered,
        }
    }
}

/// Recipients of a message, receiver first. A message addressed to its own
/// sender is only delivered once.
pub fn recipients(message: &ChatMessage) -> Vec<(Side, &str)> {
    let mut targets = vec![(Side::Receiver, message.receiver_id.as_str())];
    if message.sender_id != message.receiver_id {
        targets.push((Side::Sender, message.sender_id.as_str()));
    }
    targets
}

/// Offer a message to one recipient's connection without blocking
pub fn offer(handle: Option<&ConnectionHandle>, message: &ChatMessage) -> Delivery {
    let Some(handle) = handle else {
        return Delivery::Offline;
    };

    match handle.try_deliver(message.clone()) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Full(_)) => Delivery::Evicted,
        Err(TrySendError::Closed(_)) => Delivery::Stale,
    }
}
