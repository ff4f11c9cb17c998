//! Transport contract used by the connection pump.
//!
//! The pump only needs to send frames, receive frames and close. Deadlines
//! are applied by the caller. Implemented here for axum WebSocket halves and
//! for an in-memory channel pair.
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;

/// One unit of data on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Outgoing half of a transport
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Incoming half of a transport. `None` means the peer is gone.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Ping(data) => Message::Ping(data.into()),
            Frame::Pong(data) => Message::Pong(data.into()),
            Frame::Close => Message::Close(None),
        };
        SinkExt::send(self, message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(self)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for SplitStream<WebSocket> {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
        };
        Some(Ok(match message {
            Message::Text(text) => Frame::Text(text.to_string()),
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            Message::Ping(data) => Frame::Ping(data.to_vec()),
            Message::Pong(data) => Frame::Pong(data.to_vec()),
            Message::Close(_) => Frame::Close,
        }))
    }
}

/// Channel-backed transport, the peer side is a [`memory::Remote`]
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    pub struct MemorySink {
        tx: Option<mpsc::UnboundedSender<Frame>>,
    }

    pub struct MemorySource {
        rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    }

    /// The client end of an in-memory transport
    pub struct Remote {
        to_server: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        from_server: mpsc::UnboundedReceiver<Frame>,
    }

    pub fn pair() -> (MemorySink, MemorySource, Remote) {
        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (server_tx, from_server) = mpsc::unbounded_channel();
        (
            MemorySink { tx: Some(server_tx) },
            MemorySource { rx: server_rx },
            Remote {
                to_server,
                from_server,
            },
        )
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.tx.take();
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
            self.rx.recv().await
        }
    }

    impl Remote {
        /// Send a text frame to the server
        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.send(Frame::Text(text.into()))
        }

        pub fn send(&self, frame: Frame) -> bool {
            self.to_server.send(Ok(frame)).is_ok()
        }

        /// Make the server's next read fail
        pub fn fail_read(&self, error: &str) -> bool {
            self.to_server
                .send(Err(TransportError::Io(error.to_string())))
                .is_ok()
        }

        /// Next frame written by the server, `None` once the server closed its sink
        pub async fn recv(&mut self) -> Option<Frame> {
            self.from_server.recv().await
        }

        /// Next non-ping frame written by the server
        pub async fn recv_data(&mut self) -> Option<Frame> {
            loop {
                match self.recv().await? {
                    Frame::Ping(_) => continue,
                    frame => return Some(frame),
                }
            }
        }

        /// Split into the two directions
        pub fn split(
            self,
        ) -> (
            mpsc::UnboundedSender<Result<Frame, TransportError>>,
            mpsc::UnboundedReceiver<Frame>,
        ) {
            (self.to_server, self.from_server)
        }
    }
}
