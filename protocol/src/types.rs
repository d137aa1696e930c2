use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique node identifier
pub type NodeId = String;

/// Schedulable resources a node advertises to the network, and the shape of
/// the resource request a job carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    /// CPU in millicores (1000 = one core)
    pub cpu_millis: u64,
    /// RAM in bytes
    pub memory_bytes: u64,
    /// Whole GPUs
    pub gpu_units: u64,
}

impl NodeResources {
    /// Whether these advertised resources can satisfy a request.
    pub fn fits(&self, request: &NodeResources) -> bool {
        self.cpu_millis >= request.cpu_millis
            && self.memory_bytes >= request.memory_bytes
            && self.gpu_units >= request.gpu_units
    }
}

/// Announcement of a peer's existence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub node_id: NodeId,
    /// The address where this peer's event endpoint lives
    pub address: String,
    pub resources: NodeResources,
    /// Key/value labels used by requester node selectors
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
}

/// Configuration for a node's transport endpoint
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// This node's unique ID
    pub node_id: NodeId,
    /// Address this node listens on for events (e.g. "0.0.0.0:7700")
    pub listen_addr: String,
    /// Public address other nodes can reach us at (e.g. "myhost.com:7700")
    pub public_addr: String,
    /// Initial seed peers to bootstrap from
    pub seed_peers: Vec<String>,
    /// How often to announce ourselves and prune dead peers (seconds)
    pub announce_interval_secs: u64,
    /// How long before a peer is considered dead (seconds)
    pub peer_timeout_secs: u64,
    /// Outbound queue depth per peer
    pub outbound_queue_size: usize,
    /// This node's advertised resources
    pub resources: NodeResources,
    /// This node's labels
    pub labels: HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: "0.0.0.0:7700".into(),
            public_addr: "127.0.0.1:7700".into(),
            seed_peers: vec![],
            announce_interval_secs: 30,
            peer_timeout_secs: 120,
            outbound_queue_size: 256,
            resources: NodeResources {
                cpu_millis: 1000,
                memory_bytes: 1024 * 1024 * 1024,
                gpu_units: 0,
            },
            labels: HashMap::new(),
        }
    }
}
