//! Notification dispatcher adapter
//!
//! Translates state transitions into urgent delivery requests for the
//! external notifier. Delivery is best-effort and fire-and-forget: a
//! failure is logged and audited but never blocks or fails the call
//! session transition that triggered it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{CallEngineError, Result};
use crate::session::SessionId;

/// Outbound urgent notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub recipient: String,
    pub is_emergency: bool,
    /// Highest-urgency channel; set for escalation and failure events
    pub is_siren: bool,
    pub title: String,
    pub body: String,
    pub session_id: SessionId,
}

/// Sink for urgent notifications. Implementations own the actual delivery
/// channels (push, in-app, SMS); the engine only hands off intent.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> Result<()>;
}

/// Default dispatcher: logs at the urgency-appropriate level. Used when no
/// external notifier is wired in.
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn notify(&self, event: NotificationEvent) -> Result<()> {
        if event.is_siren {
            warn!(
                "SIREN notification to {}: {} ({}) [session {}]",
                event.recipient, event.title, event.body, event.session_id
            );
        } else {
            info!(
                "Notification to {}: {} [session {}]",
                event.recipient, event.title, event.session_id
            );
        }
        Ok(())
    }
}

/// Dispatcher that forwards events onto an mpsc channel. Tests use this to
/// observe exactly which events a transition produced.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationDispatcher for ChannelDispatcher {
    async fn notify(&self, event: NotificationEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| CallEngineError::Dispatch(format!("channel closed: {}", e)))
    }
}
