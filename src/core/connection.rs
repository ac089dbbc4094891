//! Transport abstraction for a single live connection
//! The registry owns the outbound half; the dispatcher drives the inbound half.

use async_trait::async_trait;
use futures_util::stream::{SplitStream, StreamExt};
use log::{trace, warn};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::error::{PulseError, Result};

/// Outbound side of a connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one serialized message (one JSON object per frame)
    async fn send(&self, message: &str) -> Result<()>;

    /// Close the connection; closing twice is harmless
    async fn close(&self, code: u16, reason: &str);
}

/// One inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Closed,
}

/// Inbound side of a connection
#[async_trait]
pub trait InboundFrames: Send {
    /// Next text frame, `Closed` at end of stream, or a transport-level error
    async fn receive(&mut self) -> Result<Frame>;
}

/// Transport backed by a channel that a writer task forwards to the socket
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Message>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: &str) -> Result<()> {
        self.sender
            .send(Message::text(message))
            .map_err(|_| PulseError::TransportError("connection writer has gone away".to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        if self
            .sender
            .send(Message::close_with(code, reason.to_string()))
            .is_err()
        {
            trace!("Close frame not sent, writer already finished");
        }
    }
}

/// Inbound frames read from a warp WebSocket
pub struct WebSocketInbound {
    stream: SplitStream<WebSocket>,
}

impl WebSocketInbound {
    pub fn new(stream: SplitStream<WebSocket>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl InboundFrames for WebSocketInbound {
    async fn receive(&mut self) -> Result<Frame> {
        while let Some(result) = self.stream.next().await {
            let msg = result.map_err(|e| PulseError::TransportError(e.to_string()))?;
            if msg.is_close() {
                return Ok(Frame::Closed);
            }
            if msg.is_text() {
                match msg.to_str() {
                    Ok(text) => return Ok(Frame::Text(text.to_string())),
                    Err(_) => warn!("Text frame without readable payload, skipping"),
                }
            } else if msg.is_binary() {
                warn!("Binary frame ignored ({} bytes)", msg.as_bytes().len());
            }
            // ping/pong are answered by the socket itself
        }
        Ok(Frame::Closed)
    }
}

/// Inbound frames fed from a channel; used by tests and in-process clients
pub struct ChannelInbound {
    receiver: mpsc::UnboundedReceiver<Result<Frame>>,
}

impl ChannelInbound {
    pub fn new(receiver: mpsc::UnboundedReceiver<Result<Frame>>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl InboundFrames for ChannelInbound {
    async fn receive(&mut self) -> Result<Frame> {
        match self.receiver.recv().await {
            Some(frame) => frame,
            None => Ok(Frame::Closed),
        }
    }
}
