//! Fire-and-forget sinks for billing events.
//!
//! Publishing never fails the caller; a sink that cannot deliver logs and
//! drops the event.

use crate::models::BillingEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Destination for billing events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: BillingEvent);
}

/// Writes each event as a structured log line.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: BillingEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event_type = event.event_type(), payload = %payload, "Billing event"),
            Err(e) => warn!(event_type = event.event_type(), error = %e, "Failed to encode billing event"),
        }
    }
}

/// Forwards events to an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<BillingEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BillingEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: BillingEvent) {
        if let Err(e) = self.sender.send(event) {
            warn!(event_type = e.0.event_type(), "Event receiver dropped");
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: BillingEvent) {}
}
