use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::event::JobEvent;
use crate::types::NodeId;

/// Synchronous callback invoked for every inbound event.
///
/// Handlers must not block: do the cheap thing inline (enqueue, log) and
/// schedule real work elsewhere.
pub type EventHandler = Arc<dyn Fn(JobEvent) + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is unavailable")]
    Unavailable,

    #[error("failed to connect to peer {0}")]
    Connect(String),
}

/// The peer event bus.
///
/// Delivery is best-effort: `publish` returns once the event is queued for
/// outbound delivery, not once it has been received. Events with an empty
/// target fan out to every known alive peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue an event for delivery. Fails only when the transport is shut down.
    async fn publish(&self, event: JobEvent) -> Result<(), TransportError>;

    /// Register a handler for inbound events.
    fn subscribe(&self, handler: EventHandler);

    /// Exchange announcements with a peer at `addr`.
    async fn connect(&self, addr: &str) -> Result<(), TransportError>;

    /// Stop delivering; subsequent publishes fail with `Unavailable`.
    async fn disconnect(&self);

    /// This node's ID on the network.
    fn host_id(&self) -> NodeId;
}
