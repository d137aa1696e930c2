use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{Execution, ExecutionId, Job};

#[derive(Error, Debug)]
pub enum VerifyError {
    /// Not a failure: the verifier wants more proposals before deciding.
    #[error("insufficient executions: have {have}, want {want}")]
    InsufficientExecutions { have: usize, want: usize },

    #[error("verification failed: {0}")]
    Failed(String),
}

impl VerifyError {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, VerifyError::InsufficientExecutions { .. })
    }
}

/// A definite adjudication of proposed results.
#[derive(Debug, Clone, Default)]
pub struct VerifyPartition {
    pub succeeded: Vec<ExecutionId>,
    pub failed: Vec<ExecutionId>,
}

/// Adjudicates result proposals into accepted and rejected.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        job: &Job,
        proposed: &[Execution],
    ) -> Result<VerifyPartition, VerifyError>;
}

/// Accepts every proposal as soon as it is present.
#[derive(Debug, Default)]
pub struct TrustedVerifier;

#[async_trait]
impl Verifier for TrustedVerifier {
    async fn verify(
        &self,
        _job: &Job,
        proposed: &[Execution],
    ) -> Result<VerifyPartition, VerifyError> {
        Ok(VerifyPartition {
            succeeded: proposed.iter().map(|e| e.id.clone()).collect(),
            failed: vec![],
        })
    }
}

/// Accepts the largest group of matching proposals once it reaches the job's
/// confidence; everything outside the group is rejected. Holds for more
/// executions while no group qualifies and fewer than `concurrency` proposals
/// are in.
#[derive(Debug, Default)]
pub struct DeterministicVerifier;

fn proposal_key(execution: &Execution) -> String {
    // Proposals are opaque blobs; equality of content is what matters
    let bytes = execution.result_proposal.as_deref().unwrap_or_default();
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

#[async_trait]
impl Verifier for DeterministicVerifier {
    async fn verify(
        &self,
        job: &Job,
        proposed: &[Execution],
    ) -> Result<VerifyPartition, VerifyError> {
        let mut groups: HashMap<String, Vec<&Execution>> = HashMap::new();
        for execution in proposed {
            groups.entry(proposal_key(execution)).or_default().push(execution);
        }

        let confidence = job.deal.confidence as usize;
        let winner = groups
            .values()
            .filter(|group| group.len() >= confidence)
            .max_by_key(|group| group.len());

        match winner {
            Some(group) => {
                let succeeded: Vec<ExecutionId> = group.iter().map(|e| e.id.clone()).collect();
                let failed = proposed
                    .iter()
                    .filter(|e| !succeeded.contains(&e.id))
                    .map(|e| e.id.clone())
                    .collect();
                Ok(VerifyPartition { succeeded, failed })
            }
            None if proposed.len() < job.deal.concurrency as usize => {
                Err(VerifyError::InsufficientExecutions {
                    have: proposed.len(),
                    want: job.deal.concurrency as usize,
                })
            }
            // Everything is in and nothing agrees: a definite all-reject partition
            None => Ok(VerifyPartition {
                succeeded: vec![],
                failed: proposed.iter().map(|e| e.id.clone()).collect(),
            }),
        }
    }
}

/// Delegates to a pluggable adjudication function.
pub struct ExternalVerifier {
    predicate: Arc<
        dyn Fn(&Job, &[Execution]) -> Result<VerifyPartition, VerifyError> + Send + Sync,
    >,
}

impl ExternalVerifier {
    pub fn new(
        predicate: impl Fn(&Job, &[Execution]) -> Result<VerifyPartition, VerifyError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { predicate: Arc::new(predicate) }
    }
}

#[async_trait]
impl Verifier for ExternalVerifier {
    async fn verify(
        &self,
        job: &Job,
        proposed: &[Execution],
    ) -> Result<VerifyPartition, VerifyError> {
        (self.predicate)(job, proposed)
    }
}
