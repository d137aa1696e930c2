use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::event::JobEvent;
use crate::transport::{EventHandler, Transport, TransportError};
use crate::types::NodeId;

/// Loopback event bus for tests and the devstack.
///
/// All subscribers live in one process and share the bus; `publish` delivers
/// synchronously to every handler regardless of target (subscribers filter by
/// `target_node_id` themselves). Every published event is recorded so tests
/// can assert on the traffic. Clones share the same bus.
#[derive(Clone)]
pub struct InProcessTransport {
    inner: Arc<Inner>,
    host: NodeId,
}

struct Inner {
    handlers: RwLock<Vec<EventHandler>>,
    events: Mutex<Vec<JobEvent>>,
    closed: AtomicBool,
}

impl InProcessTransport {
    pub fn new(host: impl Into<NodeId>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            host: host.into(),
        }
    }

    /// A handle onto the same bus under a different node identity.
    pub fn for_node(&self, host: impl Into<NodeId>) -> Self {
        Self {
            inner: self.inner.clone(),
            host: host.into(),
        }
    }

    /// Everything published so far, in publish order.
    pub fn events(&self) -> Vec<JobEvent> {
        self.inner.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().iter().map(|e| e.event_name.to_string()).collect()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn publish(&self, event: JobEvent) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }
        if let Ok(mut events) = self.inner.events.lock() {
            events.push(event.clone());
        }
        let handlers = match self.inner.handlers.read() {
            Ok(h) => h.clone(),
            Err(_) => return Ok(()),
        };
        for handler in handlers {
            handler(event.clone());
        }
        Ok(())
    }

    fn subscribe(&self, handler: EventHandler) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.push(handler);
        }
    }

    async fn connect(&self, _addr: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    fn host_id(&self) -> NodeId {
        self.host.clone()
    }
}
