//! Handling of messages the peer originates.
//!
//! The session invokes a handler once per fully decoded notification or
//! request from the peer, never per raw chunk. Presentation (printing,
//! UI updates) lives behind this trait.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::jsonrpc::{Notification, Request, ResponseError};

/// Trait for consumers of peer-originated messages.
///
/// Handlers run on the inbound dispatch path and must not block.
pub trait InboundHandler: Send + Sync + 'static {
    /// Called for every notification from the peer.
    fn on_notification(&self, notification: Notification);

    /// Called for every request from the peer. The returned value is sent
    /// back as the response. Defaults to `MethodNotFound`.
    fn on_request(&self, request: &Request) -> Result<Value, ResponseError> {
        Err(ResponseError::method_not_found(&request.method))
    }
}

/// Handler that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl InboundHandler for LoggingHandler {
    fn on_notification(&self, notification: Notification) {
        debug!("Unhandled notification: {}", notification.method);
    }
}

/// Peer-originated message, as forwarded by `EventForwarder`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Notification(Notification),
    Request(Request),
}

/// Handler that forwards every peer message over a channel.
///
/// Requests are forwarded for observation and answered with
/// `MethodNotFound`.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventForwarder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl InboundHandler for EventForwarder {
    fn on_notification(&self, notification: Notification) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(SessionEvent::Notification(notification));
    }

    fn on_request(&self, request: &Request) -> Result<Value, ResponseError> {
        let _ = self.tx.send(SessionEvent::Request(request.clone()));
        Err(ResponseError::method_not_found(&request.method))
    }
}
