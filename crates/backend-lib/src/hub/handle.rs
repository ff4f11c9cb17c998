//! Connection handles: the registry's side and the pump's side of one live connection.
use chathub_common::{ChatMessage, UserId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one accepted connection.
///
/// Two connections of the same user never share an id, which is what lets a
/// retire request tell a superseded connection from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended
    ClientClosed,
    /// Reading from the transport failed
    ReadError,
    /// Writing to the transport failed or missed its deadline
    WriteError,
    /// Nothing was read within the read deadline
    ProbeTimeout,
    /// Inbound frame exceeded the size limit
    FrameTooLarge,
    /// Inbound frame could not be decoded
    Malformed,
    /// A newer connection for the same user was admitted
    Superseded,
    /// Outbound queue was full when the registry tried to deliver
    Backpressure,
    /// The registry is gone or refused the connection
    HubUnavailable,
    /// The server is shutting down
    Shutdown,
}

impl CloseReason {
    /// True when the registry removed the connection itself, in which case the
    /// pump must not retire it again.
    pub fn is_eviction(&self) -> bool {
        matches!(self, Self::Superseded | Self::Backpressure | Self::Shutdown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::ProbeTimeout => "probe_timeout",
            Self::FrameTooLarge => "frame_too_large",
            Self::Malformed => "malformed",
            Self::Superseded => "superseded",
            Self::Backpressure => "backpressure",
            Self::HubUnavailable => "hub_unavailable",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry-owned half of a connection.
///
/// Holds the only producer of the outbound queue, so dropping the handle
/// closes the queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<ChatMessage>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

/// Pump-owned half of a connection
#[derive(Debug)]
pub struct ConnectionEndpoint {
    pub id: ConnectionId,
    pub user_id: UserId,
    outbound: mpsc::Receiver<ChatMessage>,
    close: CloseSignal,
}

impl ConnectionHandle {
    /// Create both halves of a new connection with an outbound queue of `capacity`
    pub fn new(user_id: impl Into<UserId>, capacity: usize) -> (Self, ConnectionEndpoint) {
        let id = ConnectionId::next();
        let user_id = user_id.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);

        let handle = Self {
            id,
            user_id: user_id.clone(),
            outbound: outbound_tx,
            close_tx,
        };
        let endpoint = ConnectionEndpoint {
            id,
            user_id,
            outbound: outbound_rx,
            close: CloseSignal(close_rx),
        };
        (handle, endpoint)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Non-blocking enqueue onto the outbound queue
    pub(crate) fn try_deliver(
        &self,
        message: ChatMessage,
    ) -> Result<(), mpsc::error::TrySendError<ChatMessage>> {
        self.outbound.try_send(message)
    }

    /// Tell the pump why it is being closed, then close its queue
    pub(crate) fn evict(self, reason: CloseReason) {
        self.close_tx.send_replace(Some(reason));
    }
}

impl ConnectionEndpoint {
    /// Reason the registry gave when it evicted this connection, if it did
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close.reason()
    }

    /// Take the next queued message without waiting.
    /// `None` means the queue is empty or closed.
    pub fn try_next(&mut self) -> Option<ChatMessage> {
        self.outbound.try_recv().ok()
    }

    /// Wait for the next queued message, `None` once the queue is closed and drained
    pub async fn next(&mut self) -> Option<ChatMessage> {
        self.outbound.recv().await
    }

    pub fn into_parts(self) -> (mpsc::Receiver<ChatMessage>, CloseSignal) {
        (self.outbound, self.close)
    }
}

/// Receiver side of the eviction signal
#[derive(Debug, Clone)]
pub struct CloseSignal(watch::Receiver<Option<CloseReason>>);

impl CloseSignal {
    pub fn reason(&self) -> Option<CloseReason> {
        *self.0.borrow()
    }

    /// Resolve once the registry closes this connection.
    ///
    /// A handle dropped without a reason (retired, or lost in a registry
    /// restart) resolves to [`CloseReason::HubUnavailable`].
    pub async fn closed(&mut self) -> CloseReason {
        loop {
            if let Some(reason) = *self.0.borrow_and_update() {
                return reason;
            }
            if self.0.changed().await.is_err() {
                return self.reason().unwrap_or(CloseReason::HubUnavailable);
            }
        }
    }
}
