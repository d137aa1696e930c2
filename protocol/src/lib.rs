//! Armada network protocol
//!
//! Requester nodes publish job-lifecycle events to compute peers, compute peers
//! answer with bids and results, and everything travels over a best-effort
//! peer-to-peer event bus.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐  AskForBid   ┌───────────┐
//!  │ requester │─────────────►│ compute A │
//!  │   node    │◄─────────────│           │
//!  └───────────┘  BidReceived └───────────┘
//!        │                          ▲
//!        └──── ResultAccepted ──────┘
//! ```
//!
//! ## Event bus
//! - Delivery is best-effort, at-least-once while a peer is reachable
//! - No ordering between independent events, per-pair FIFO by source
//! - Events are JSON envelopes (see [`event::JobEvent`])
//!
//! ## Peer discovery
//! - Each node keeps a peer registry and announces itself to seed peers
//! - Registries merge announcements (union) and prune peers that go quiet
//! - Peers advertise schedulable resources and labels for node selection

pub mod event;
pub mod http;
pub mod inprocess;
pub mod peer;
pub mod transport;
pub mod types;

pub use event::*;
pub use http::HttpTransport;
pub use inprocess::InProcessTransport;
pub use peer::{PeerInfo, PeerRegistry};
pub use transport::{EventHandler, Transport, TransportError};
pub use types::*;
