use armada_protocol::JobEvent;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{RequesterError, Result};
use crate::model::*;

#[derive(Debug, Clone)]
pub struct UpdateJobStateRequest {
    pub job_id: JobId,
    pub new_state: JobStateType,
    pub status: Option<String>,
    /// CAS: when set and the stored version differs, the update is rejected
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UpdateExecutionRequest {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub new_state: ExecutionStateType,
    pub status: Option<String>,
    pub result_proposal: Option<Vec<u8>>,
    pub published_result: Option<StorageRef>,
    pub expected_version: Option<u64>,
}

impl UpdateExecutionRequest {
    pub fn transition(job_id: &str, execution_id: &str, new_state: ExecutionStateType) -> Self {
        Self {
            job_id: job_id.to_string(),
            execution_id: execution_id.to_string(),
            new_state,
            status: None,
            result_proposal: None,
            published_result: None,
            expected_version: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    CreatedAt,
    Id,
}

#[derive(Debug, Clone)]
pub struct ListRequest {
    /// Matches jobs whose annotations contain this label; empty matches all
    pub selector: Option<String>,
    /// 0 means unlimited
    pub limit: usize,
    pub sort_by: SortKey,
    pub ascending: bool,
    pub include_terminated: bool,
}

impl Default for ListRequest {
    fn default() -> Self {
        Self {
            selector: None,
            limit: 0,
            sort_by: SortKey::CreatedAt,
            ascending: true,
            include_terminated: true,
        }
    }
}

/// Read-only view handed out by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: Job,
    pub state: JobState,
}

/// Durable map from job ID to spec, state and executions.
///
/// The store exclusively owns the persisted records; every read returns a
/// snapshot copy. Updates enforce the execution-state partial order and the
/// terminal-job guard.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: Job) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Job>;
    async fn get_job_state(&self, id: &str) -> Result<JobState>;
    async fn update_job_state(&self, req: UpdateJobStateRequest) -> Result<JobState>;
    async fn create_execution(&self, job_id: &str, execution: Execution) -> Result<()>;
    async fn update_execution(&self, req: UpdateExecutionRequest) -> Result<Execution>;
    async fn list_jobs(&self, req: ListRequest) -> Result<Vec<JobSnapshot>>;
    /// Append to the per-job event history (for `/events/{id}`).
    async fn append_event(&self, event: JobEvent);
    async fn events(&self, job_id: &str) -> Vec<JobEvent>;
    async fn non_terminal_jobs(&self) -> Vec<JobId>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    states: RwLock<HashMap<JobId, JobState>>,
    history: RwLock<HashMap<JobId, Vec<JobEvent>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(RequesterError::AlreadyExists(job.id));
        }
        let mut states = self.states.write().await;
        states.insert(job.id.clone(), JobState::new(job.id.clone()));
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RequesterError::NotFound(id.to_string()))
    }

    async fn get_job_state(&self, id: &str) -> Result<JobState> {
        self.states
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RequesterError::NotFound(id.to_string()))
    }

    async fn update_job_state(&self, req: UpdateJobStateRequest) -> Result<JobState> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(&req.job_id)
            .ok_or_else(|| RequesterError::NotFound(req.job_id.clone()))?;

        if let Some(expected) = req.expected_version {
            if state.version != expected {
                return Err(RequesterError::ConcurrentUpdate { job_id: req.job_id });
            }
        }
        if state.state.is_terminal() {
            return Err(RequesterError::JobTerminated(req.job_id));
        }

        state.state = req.new_state;
        if let Some(status) = req.status {
            state.status = status;
        }
        state.version += 1;
        state.update_time = Utc::now();
        Ok(state.clone())
    }

    async fn create_execution(&self, job_id: &str, execution: Execution) -> Result<()> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(job_id)
            .ok_or_else(|| RequesterError::NotFound(job_id.to_string()))?;
        if state.state.is_terminal() {
            return Err(RequesterError::JobTerminated(job_id.to_string()));
        }
        state.executions.push(execution);
        state.version += 1;
        state.update_time = Utc::now();
        Ok(())
    }

    async fn update_execution(&self, req: UpdateExecutionRequest) -> Result<Execution> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(&req.job_id)
            .ok_or_else(|| RequesterError::NotFound(req.job_id.clone()))?;
        if state.state.is_terminal() {
            return Err(RequesterError::JobTerminated(req.job_id));
        }

        let execution = state
            .executions
            .iter_mut()
            .find(|e| e.id == req.execution_id)
            .ok_or_else(|| RequesterError::ExecutionNotFound(req.execution_id.clone()))?;

        if let Some(expected) = req.expected_version {
            if execution.version != expected {
                return Err(RequesterError::ConcurrentUpdate { job_id: req.job_id });
            }
        }
        if !execution.state.can_transition_to(req.new_state) {
            return Err(RequesterError::InvalidStateTransition {
                from: execution.state.to_string(),
                to: req.new_state.to_string(),
            });
        }

        execution.state = req.new_state;
        if let Some(status) = req.status {
            execution.status = status;
        }
        if let Some(proposal) = req.result_proposal {
            execution.result_proposal = Some(proposal);
        }
        if let Some(published) = req.published_result {
            execution.published_result = Some(published);
        }
        // update_time never goes backwards, even with a skewed clock
        execution.update_time = Utc::now().max(execution.update_time);
        execution.version += 1;
        let snapshot = execution.clone();

        state.version += 1;
        state.update_time = Utc::now();
        Ok(snapshot)
    }

    async fn list_jobs(&self, req: ListRequest) -> Result<Vec<JobSnapshot>> {
        let jobs = self.jobs.read().await;
        let states = self.states.read().await;

        let mut snapshots: Vec<JobSnapshot> = jobs
            .values()
            .filter(|job| match &req.selector {
                Some(label) if !label.is_empty() => job.spec.annotations.iter().any(|a| a == label),
                _ => true,
            })
            .filter_map(|job| {
                let state = states.get(&job.id)?;
                if !req.include_terminated && state.state.is_terminal() {
                    return None;
                }
                Some(JobSnapshot { job: job.clone(), state: state.clone() })
            })
            .collect();

        snapshots.sort_by(|a, b| {
            let ord = match req.sort_by {
                SortKey::CreatedAt => a
                    .job
                    .created_at
                    .cmp(&b.job.created_at)
                    .then_with(|| a.job.id.cmp(&b.job.id)),
                SortKey::Id => a.job.id.cmp(&b.job.id),
            };
            if req.ascending {
                ord
            } else {
                ord.reverse()
            }
        });

        if req.limit > 0 {
            snapshots.truncate(req.limit);
        }
        Ok(snapshots)
    }

    async fn append_event(&self, event: JobEvent) {
        let mut history = self.history.write().await;
        history.entry(event.job_id.clone()).or_default().push(event);
    }

    async fn events(&self, job_id: &str) -> Vec<JobEvent> {
        self.history.read().await.get(job_id).cloned().unwrap_or_default()
    }

    async fn non_terminal_jobs(&self) -> Vec<JobId> {
        self.states
            .read()
            .await
            .values()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.job_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_protocol::NodeResources;

    fn make_job() -> Job {
        let spec = JobSpec {
            engine: EngineSpec::Noop,
            verifier: VerifierKind::Trusted,
            publisher: PublisherKind::Noop,
            resources: NodeResources::default(),
            network: NetworkPolicy::None,
            inputs: vec![],
            outputs: vec![],
            annotations: vec!["suite:store".into()],
            node_selectors: vec![],
            timeout_secs: 60.0,
            sharding: None,
        };
        Job::admit(spec, Deal::default(), Default::default()).unwrap()
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let store = InMemoryJobStore::new();
        let job = make_job();
        store.create_job(job.clone()).await.unwrap();
        let err = store.create_job(job).await.unwrap_err();
        assert!(matches!(err, RequesterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn cas_rejects_stale_writers() {
        let store = InMemoryJobStore::new();
        let job = make_job();
        let id = job.id.clone();
        store.create_job(job).await.unwrap();

        let seen = store.get_job_state(&id).await.unwrap();
        store
            .update_job_state(UpdateJobStateRequest {
                job_id: id.clone(),
                new_state: JobStateType::InProgress,
                status: None,
                expected_version: Some(seen.version),
            })
            .await
            .unwrap();

        // A second writer still holding the old version loses
        let err = store
            .update_job_state(UpdateJobStateRequest {
                job_id: id.clone(),
                new_state: JobStateType::Failed,
                status: None,
                expected_version: Some(seen.version),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RequesterError::ConcurrentUpdate { .. }));
    }

    #[tokio::test]
    async fn terminal_jobs_reject_all_updates() {
        let store = InMemoryJobStore::new();
        let job = make_job();
        let id = job.id.clone();
        store.create_job(job).await.unwrap();
        store
            .update_job_state(UpdateJobStateRequest {
                job_id: id.clone(),
                new_state: JobStateType::Cancelled,
                status: Some("user asked".into()),
                expected_version: None,
            })
            .await
            .unwrap();

        let err = store
            .update_job_state(UpdateJobStateRequest {
                job_id: id.clone(),
                new_state: JobStateType::InProgress,
                status: None,
                expected_version: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RequesterError::JobTerminated(_)));

        let err = store
            .create_execution(&id, Execution::new("node-a", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RequesterError::JobTerminated(_)));
    }

    #[tokio::test]
    async fn executions_cannot_move_backwards() {
        let store = InMemoryJobStore::new();
        let job = make_job();
        let id = job.id.clone();
        store.create_job(job).await.unwrap();

        let execution = Execution::new("node-a", 0);
        let exec_id = execution.id.clone();
        store.create_execution(&id, execution).await.unwrap();

        store
            .update_execution(UpdateExecutionRequest::transition(
                &id,
                &exec_id,
                ExecutionStateType::BidReceived,
            ))
            .await
            .unwrap();

        let err = store
            .update_execution(UpdateExecutionRequest::transition(
                &id,
                &exec_id,
                ExecutionStateType::AskedToBid,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RequesterError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn list_filters_sorts_and_paginates() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..21 {
            let job = make_job();
            ids.push(job.id.clone());
            store.create_job(job).await.unwrap();
        }

        let page = store
            .list_jobs(ListRequest { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.len(), 10);

        let all = store
            .list_jobs(ListRequest { limit: 25, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 21);

        let none = store
            .list_jobs(ListRequest {
                selector: Some("no-such-label".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());

        let matching = store
            .list_jobs(ListRequest {
                selector: Some("suite:store".into()),
                limit: 25,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(matching.len(), 21);

        let by_id = store
            .list_jobs(ListRequest { sort_by: SortKey::Id, limit: 0, ..Default::default() })
            .await
            .unwrap();
        let mut sorted = ids.clone();
        sorted.sort();
        let got: Vec<String> = by_id.iter().map(|s| s.job.id.clone()).collect();
        assert_eq!(got, sorted);
    }
}
