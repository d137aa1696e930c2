use armada_protocol::NodeResources;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::RequesterError;
use crate::sharding::{ExecutionPlan, ShardingConfig};

pub type JobId = String;
pub type ExecutionId = String;

pub const API_VERSION: &str = "V1";

/// How the workload runs on a compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineSpec {
    Docker {
        image: String,
        #[serde(default)]
        entrypoint: Vec<String>,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
    },
    Wasm {
        module: StorageRef,
        entry_point: String,
    },
    /// Does nothing; used by tests and the devstack
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    Trusted,
    Deterministic,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherKind {
    Ipfs,
    Estuary,
    Noop,
}

/// Outbound network access granted to the workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkPolicy {
    None,
    Http { domains: Vec<String> },
    Full,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageSource {
    Ipfs,
    Url,
    LocalDirectory,
    Inline,
}

/// Content-addressed input or published output location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRef {
    pub source: StorageSource,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Where the data is mounted inside the workload
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputVolume {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorOperator {
    Eq,
    NotEq,
    Exists,
}

/// A single node-selector predicate, matched against peer labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match self.operator {
            SelectorOperator::Exists => labels.contains_key(&self.key),
            SelectorOperator::Eq => labels
                .get(&self.key)
                .map(|v| self.values.iter().any(|want| want == v))
                .unwrap_or(false),
            SelectorOperator::NotEq => labels
                .get(&self.key)
                .map(|v| !self.values.iter().any(|want| want == v))
                .unwrap_or(true),
        }
    }
}

/// The commercial/operational parameters of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Deal {
    /// Target number of successful executions
    pub concurrency: u32,
    /// Minimum successful executions for partial success
    #[serde(default)]
    pub confidence: u32,
    /// Bids required before accepting any
    #[serde(default)]
    pub min_bids: u32,
}

impl Default for Deal {
    fn default() -> Self {
        Self { concurrency: 1, confidence: 0, min_bids: 0 }
    }
}

impl Deal {
    /// Fill in the zero-valued fields the way production defaults do.
    pub fn normalized(mut self) -> Self {
        if self.concurrency == 0 {
            self.concurrency = 1;
        }
        if self.confidence == 0 {
            self.confidence = self.concurrency;
        }
        if self.min_bids == 0 {
            self.min_bids = self.concurrency.max(self.confidence);
        }
        self
    }

    pub fn validate(&self) -> Result<(), RequesterError> {
        if self.concurrency < 1 {
            return Err(RequesterError::InvalidJob("concurrency must be >= 1".into()));
        }
        if self.confidence > self.concurrency {
            return Err(RequesterError::InvalidJob(
                "confidence cannot exceed concurrency".into(),
            ));
        }
        if self.min_bids < self.confidence {
            return Err(RequesterError::InvalidJob(
                "min_bids cannot be below confidence".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub engine: EngineSpec,
    pub verifier: VerifierKind,
    pub publisher: PublisherKind,
    #[serde(default)]
    pub resources: NodeResources,
    #[serde(default)]
    pub network: NetworkPolicy,
    #[serde(default)]
    pub inputs: Vec<StorageRef>,
    #[serde(default)]
    pub outputs: Vec<OutputVolume>,
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub node_selectors: Vec<SelectorRequirement>,
    /// Wall-clock budget for one execution, seconds
    pub timeout_secs: f64,
    #[serde(default)]
    pub sharding: Option<ShardingConfig>,
}

/// A user-submitted unit of work. Immutable after admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub api_version: String,
    pub created_at: DateTime<Utc>,
    pub spec: JobSpec,
    pub deal: Deal,
    pub execution_plan: ExecutionPlan,
}

/// Characters allowed in annotations. Anything else is stripped at admission.
fn is_safe_annotation(annotation: &str) -> bool {
    !annotation.is_empty()
        && annotation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || " _.:/@-".contains(c))
}

impl Job {
    /// Admit a job: scrub annotations, normalize and validate the deal, and
    /// freeze the execution plan. Rejected specs never reach the scheduler.
    pub fn admit(
        mut spec: JobSpec,
        deal: Deal,
        execution_plan: ExecutionPlan,
    ) -> Result<Job, RequesterError> {
        let deal = deal.normalized();
        deal.validate()?;

        if !spec.timeout_secs.is_finite() || spec.timeout_secs <= 0.0 {
            return Err(RequesterError::InvalidJob("timeout must be > 0".into()));
        }

        let (safe, unsafe_annotations): (Vec<String>, Vec<String>) = spec
            .annotations
            .drain(..)
            .partition(|a| is_safe_annotation(a));
        if !unsafe_annotations.is_empty() {
            tracing::warn!(
                stripped = ?unsafe_annotations,
                "Unsafe annotations stripped; labels may only contain alphanumerics and ' _.:/@-'"
            );
        }
        spec.annotations = safe;

        Ok(Job {
            id: uuid::Uuid::new_v4().to_string(),
            api_version: API_VERSION.to_string(),
            created_at: Utc::now(),
            spec,
            deal,
            execution_plan,
        })
    }
}

// --- Job state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStateType {
    New,
    InProgress,
    CompletedSuccessfully,
    CompletedPartially,
    Failed,
    Cancelled,
}

impl JobStateType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStateType::CompletedSuccessfully
                | JobStateType::CompletedPartially
                | JobStateType::Failed
                | JobStateType::Cancelled
        )
    }
}

impl std::fmt::Display for JobStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStateType::New => "New",
            JobStateType::InProgress => "InProgress",
            JobStateType::CompletedSuccessfully => "CompletedSuccessfully",
            JobStateType::CompletedPartially => "CompletedPartially",
            JobStateType::Failed => "Failed",
            JobStateType::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStateType {
    AskedToBid,
    BidReceived,
    BidAccepted,
    BidRejected,
    ResultProposed,
    ResultAccepted,
    ResultRejected,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStateType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStateType::BidRejected
                | ExecutionStateType::ResultRejected
                | ExecutionStateType::Completed
                | ExecutionStateType::Failed
                | ExecutionStateType::Cancelled
        )
    }

    /// The monotone partial order over execution states. The store refuses
    /// any update that is not listed here.
    pub fn can_transition_to(&self, next: ExecutionStateType) -> bool {
        use ExecutionStateType::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) | (_, Cancelled) => true,
            (AskedToBid, BidReceived) => true,
            (BidReceived, BidAccepted) | (BidReceived, BidRejected) => true,
            (BidAccepted, ResultProposed) => true,
            (ResultProposed, ResultAccepted) | (ResultProposed, ResultRejected) => true,
            (ResultAccepted, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The variant names are already the wire names.
        write!(f, "{self:?}")
    }
}

/// One attempt to carry out a job on one compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// Fixed at creation
    pub node_id: String,
    pub shard_index: u32,
    pub state: ExecutionStateType,
    /// Free-form reason for the latest transition
    #[serde(default)]
    pub status: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// Verifier-specific payload attached at `ResultProposed`
    #[serde(default)]
    pub result_proposal: Option<Vec<u8>>,
    /// Where the published result lives, attached at `Completed`
    #[serde(default)]
    pub published_result: Option<StorageRef>,
    pub version: u64,
}

impl Execution {
    pub fn new(node_id: impl Into<String>, shard_index: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            shard_index,
            state: ExecutionStateType::AskedToBid,
            status: String::new(),
            create_time: now,
            update_time: now,
            result_proposal: None,
            published_result: None,
            version: 0,
        }
    }
}

/// Mutable state of a job, owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub state: JobStateType,
    #[serde(default)]
    pub status: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// Compare-and-set token, bumped on every write
    pub version: u64,
    pub executions: Vec<Execution>,
}

impl JobState {
    pub fn new(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            state: JobStateType::New,
            status: String::new(),
            create_time: now,
            update_time: now,
            version: 0,
            executions: Vec::new(),
        }
    }

    pub fn executions_in(&self, state: ExecutionStateType) -> Vec<&Execution> {
        self.executions.iter().filter(|e| e.state == state).collect()
    }

    pub fn count_in(&self, state: ExecutionStateType) -> usize {
        self.executions.iter().filter(|e| e.state == state).count()
    }

    /// Executions that are still making progress toward a result.
    pub fn active_executions(&self) -> Vec<&Execution> {
        self.executions.iter().filter(|e| !e.state.is_terminal()).collect()
    }

    pub fn execution(&self, execution_id: &str) -> Option<&Execution> {
        self.executions.iter().find(|e| e.id == execution_id)
    }

    /// Node IDs that have ever been asked, for retry dedup.
    pub fn tried_nodes(&self) -> Vec<&str> {
        self.executions.iter().map(|e| e.node_id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_spec() -> JobSpec {
        JobSpec {
            engine: EngineSpec::Noop,
            verifier: VerifierKind::Trusted,
            publisher: PublisherKind::Noop,
            resources: NodeResources::default(),
            network: NetworkPolicy::None,
            inputs: vec![],
            outputs: vec![],
            annotations: vec![],
            node_selectors: vec![],
            timeout_secs: 60.0,
            sharding: None,
        }
    }

    #[test]
    fn admission_strips_unsafe_annotations() {
        let mut spec = noop_spec();
        spec.annotations = vec![
            "team:data".into(),
            "bad;annotation".into(),
            "".into(),
            "a/b_c.d-e".into(),
        ];
        let job = Job::admit(spec, Deal::default(), ExecutionPlan::default()).unwrap();
        assert_eq!(job.spec.annotations, vec!["team:data", "a/b_c.d-e"]);
    }

    #[test]
    fn admission_normalizes_deal() {
        let job = Job::admit(
            noop_spec(),
            Deal { concurrency: 3, confidence: 0, min_bids: 0 },
            ExecutionPlan::default(),
        )
        .unwrap();
        assert_eq!(job.deal.confidence, 3);
        assert_eq!(job.deal.min_bids, 3);
    }

    #[test]
    fn admission_rejects_bad_deals_and_timeouts() {
        let err = Job::admit(
            noop_spec(),
            Deal { concurrency: 2, confidence: 3, min_bids: 3 },
            ExecutionPlan::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RequesterError::InvalidJob(_)));

        let mut spec = noop_spec();
        spec.timeout_secs = 0.0;
        let err = Job::admit(spec, Deal::default(), ExecutionPlan::default()).unwrap_err();
        assert!(matches!(err, RequesterError::InvalidJob(_)));
    }

    #[test]
    fn execution_transitions_are_monotone() {
        use ExecutionStateType::*;
        assert!(AskedToBid.can_transition_to(BidReceived));
        assert!(BidReceived.can_transition_to(BidAccepted));
        assert!(BidAccepted.can_transition_to(ResultProposed));
        assert!(ResultProposed.can_transition_to(ResultAccepted));
        assert!(ResultAccepted.can_transition_to(Completed));
        assert!(BidReceived.can_transition_to(Failed));

        // No going back, no skipping past terminals
        assert!(!BidAccepted.can_transition_to(BidReceived));
        assert!(!BidReceived.can_transition_to(BidReceived));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!BidRejected.can_transition_to(ResultProposed));
        assert!(!AskedToBid.can_transition_to(ResultProposed));
    }

    #[test]
    fn selector_requirements_match_labels() {
        let mut labels = HashMap::new();
        labels.insert("zone".to_string(), "eu-1".to_string());

        let eq = SelectorRequirement {
            key: "zone".into(),
            operator: SelectorOperator::Eq,
            values: vec!["eu-1".into()],
        };
        assert!(eq.matches(&labels));

        let neq = SelectorRequirement {
            key: "zone".into(),
            operator: SelectorOperator::NotEq,
            values: vec!["us-1".into()],
        };
        assert!(neq.matches(&labels));

        let exists = SelectorRequirement {
            key: "gpu".into(),
            operator: SelectorOperator::Exists,
            values: vec![],
        };
        assert!(!exists.matches(&labels));
    }
}
