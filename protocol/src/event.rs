use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Job-lifecycle event kinds carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    Created,
    AskForBid,
    BidReceived,
    BidAccepted,
    BidRejected,
    BidCancelled,
    ComputeError,
    ResultProposed,
    ResultAccepted,
    ResultRejected,
    Published,
    CancelExecution,
    Cancelled,
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventName::Created => "Created",
            EventName::AskForBid => "AskForBid",
            EventName::BidReceived => "BidReceived",
            EventName::BidAccepted => "BidAccepted",
            EventName::BidRejected => "BidRejected",
            EventName::BidCancelled => "BidCancelled",
            EventName::ComputeError => "ComputeError",
            EventName::ResultProposed => "ResultProposed",
            EventName::ResultAccepted => "ResultAccepted",
            EventName::ResultRejected => "ResultRejected",
            EventName::Published => "Published",
            EventName::CancelExecution => "CancelExecution",
            EventName::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

/// The JSON envelope every event travels in.
///
/// `TargetNodeID` empty means broadcast to all known peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "EventID")]
    pub event_id: String,
    #[serde(rename = "EventName")]
    pub event_name: EventName,
    #[serde(rename = "JobID")]
    pub job_id: String,
    #[serde(rename = "SourceNodeID")]
    pub source_node_id: NodeId,
    #[serde(rename = "TargetNodeID", default)]
    pub target_node_id: NodeId,
    /// Unix seconds
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Payload", default)]
    pub payload: serde_json::Value,
}

impl JobEvent {
    pub fn new(event_name: EventName, job_id: impl Into<String>, source: impl Into<NodeId>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_name,
            job_id: job_id.into(),
            source_node_id: source.into(),
            target_node_id: String::new(),
            timestamp: Utc::now().timestamp(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_target(mut self, target: impl Into<NodeId>) -> Self {
        self.target_node_id = target.into();
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        // Payload types are plain data structs; serialization cannot fail on them.
        self.payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_node_id.is_empty()
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

// --- Typed payloads ---

/// Payload of `AskForBid`: which shards of the job the node is asked to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForBidPayload {
    pub execution_id: String,
    #[serde(default)]
    pub shard_indexes: Vec<u32>,
}

/// Payload of `BidReceived` / `BidAccepted` / `BidRejected` / `BidCancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidPayload {
    pub execution_id: String,
}

/// Payload of `ResultProposed`: a verifier-specific proposal blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultProposedPayload {
    pub execution_id: String,
    pub proposal: Vec<u8>,
}

/// Payload of `Published`: where the results landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedPayload {
    pub execution_id: String,
    /// Engine-specific storage reference, e.g. an IPFS CID
    pub result: serde_json::Value,
}

/// Payload of `ComputeError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeErrorPayload {
    pub execution_id: String,
    pub error: String,
}

/// Payload of `Cancelled` / `CancelExecution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_envelope_field_names() {
        let event = JobEvent::new(EventName::AskForBid, "job-1", "node-a")
            .with_target("node-b")
            .with_payload(&AskForBidPayload {
                execution_id: "exec-1".into(),
                shard_indexes: vec![0, 1],
            });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["EventName"], "AskForBid");
        assert_eq!(json["JobID"], "job-1");
        assert_eq!(json["SourceNodeID"], "node-a");
        assert_eq!(json["TargetNodeID"], "node-b");
        assert!(json["Timestamp"].is_i64());
        assert_eq!(json["Payload"]["execution_id"], "exec-1");

        let back: JobEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_name, EventName::AskForBid);
        let payload: AskForBidPayload = back.payload_as().unwrap();
        assert_eq!(payload.shard_indexes, vec![0, 1]);
    }

    #[test]
    fn missing_target_means_broadcast() {
        let raw = r#"{"EventID":"e","EventName":"Created","JobID":"j",
                      "SourceNodeID":"n","Timestamp":0}"#;
        let event: JobEvent = serde_json::from_str(raw).unwrap();
        assert!(event.is_broadcast());
        assert!(event.payload.is_null());
    }
}
