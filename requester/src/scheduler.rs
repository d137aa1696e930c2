use armada_protocol::{
    AskForBidPayload, BidPayload, CancelPayload, ComputeErrorPayload, EventName, JobEvent,
    NodeId, PeerRegistry, PublishedPayload, ResultProposedPayload, Transport,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, MutexGuard};

use crate::error::{RequesterError, Result};
use crate::model::*;
use crate::retry::{RetryRequest, RetryStrategy};
use crate::selector::{NodeRank, NodeSelector};
use crate::store::{JobStore, UpdateExecutionRequest, UpdateJobStateRequest};
use crate::verifier::Verifier;

/// Where the scheduler learns which compute nodes exist.
#[async_trait]
pub trait NodeRoster: Send + Sync {
    async fn roster(&self) -> Vec<NodeRank>;
}

/// Fixed roster for tests and the devstack.
pub struct StaticRoster(pub Vec<NodeRank>);

#[async_trait]
impl NodeRoster for StaticRoster {
    async fn roster(&self) -> Vec<NodeRank> {
        self.0.clone()
    }
}

/// Roster backed by the transport's peer registry.
pub struct RegistryRoster {
    registry: PeerRegistry,
}

impl RegistryRoster {
    pub fn new(registry: PeerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl NodeRoster for RegistryRoster {
    async fn roster(&self) -> Vec<NodeRank> {
        self.registry
            .alive_peers()
            .await
            .into_iter()
            .map(|p| NodeRank {
                node_id: p.node_id,
                resources: p.resources,
                labels: p.labels,
                load: 0,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Terminate a job when retry-node selection itself errors, even if the
    /// candidate list came back empty.
    pub fail_on_selector_error: bool,
    /// Cadence of the stale-job sweep
    pub sweep_interval: Duration,
    /// Bound on the inbound event queue; overflow drops the newest event
    pub inbound_queue_size: usize,
    /// Shard count for the per-job lock map
    pub lock_shards: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fail_on_selector_error: true,
            sweep_interval: Duration::from_secs(30),
            inbound_queue_size: 1024,
            lock_shards: 64,
        }
    }
}

/// Per-job serialization. Sharded by job-id hash; semantics are as if one
/// global lock.
struct JobLocks {
    shards: Vec<Mutex<()>>,
}

impl JobLocks {
    fn new(count: usize) -> Self {
        Self {
            shards: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, job_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        job_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index].lock().await
    }
}

/// The requester-side job state machine.
///
/// Consumes inbound events and timer ticks, mutates the store, and emits
/// outbound events. All store-visible changes for one job are serialized
/// through the job's lock; outbound publishes are collected under the lock
/// and fired after it is released, never awaited inside it.
pub struct BaseScheduler {
    host_id: NodeId,
    store: Arc<dyn JobStore>,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn Verifier>,
    retry: Arc<dyn RetryStrategy>,
    roster: Arc<dyn NodeRoster>,
    selector: NodeSelector,
    config: SchedulerConfig,
    locks: JobLocks,
}

impl BaseScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_id: impl Into<NodeId>,
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn Verifier>,
        retry: Arc<dyn RetryStrategy>,
        roster: Arc<dyn NodeRoster>,
        selector: NodeSelector,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let locks = JobLocks::new(config.lock_shards);
        Arc::new(Self {
            host_id: host_id.into(),
            store,
            transport,
            verifier,
            retry,
            roster,
            selector,
            config,
            locks,
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Register an admitted job and ask the selected nodes for bids.
    pub async fn submit(&self, job: Job) -> Result<Job> {
        let job_id = job.id.clone();
        let mut out = Vec::new();
        {
            let _guard = self.locks.lock(&job_id).await;
            self.store.create_job(job.clone()).await?;
            out.push(JobEvent::new(EventName::Created, &job_id, &self.host_id));

            let roster = self.roster.roster().await;
            let asked = self.selector.select_nodes_for_ask(&job, &roster)?;

            if asked.is_empty() {
                tracing::warn!(job_id = %job_id, "No nodes matched the job, waiting for peers");
            } else {
                for node in &asked {
                    self.ask_node_for_bid(&job, node, &mut out).await?;
                }
                self.store
                    .update_job_state(UpdateJobStateRequest {
                        job_id: job_id.clone(),
                        new_state: JobStateType::InProgress,
                        status: Some(format!("asked {} nodes for bids", asked.len())),
                        expected_version: None,
                    })
                    .await?;
                tracing::info!(job_id = %job_id, nodes = asked.len(), "Job submitted, bids requested");
            }
        }
        self.flush(out).await;
        Ok(job)
    }

    async fn ask_node_for_bid(
        &self,
        job: &Job,
        node: &str,
        out: &mut Vec<JobEvent>,
    ) -> Result<()> {
        let execution = Execution::new(node, 0);
        let payload = AskForBidPayload {
            execution_id: execution.id.clone(),
            shard_indexes: job.execution_plan.shard_indexes(),
        };
        self.store.create_execution(&job.id, execution).await?;
        out.push(
            JobEvent::new(EventName::AskForBid, &job.id, &self.host_id)
                .with_target(node)
                .with_payload(&payload),
        );
        Ok(())
    }

    /// Cancel a job on a user's request.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> Result<()> {
        let mut out = Vec::new();
        let result = {
            let _guard = self.locks.lock(job_id).await;
            self.cancel_locked(job_id, reason, &mut out).await
        };
        self.flush(out).await;
        result
    }

    async fn cancel_locked(
        &self,
        job_id: &str,
        reason: &str,
        out: &mut Vec<JobEvent>,
    ) -> Result<()> {
        let state = self.store.get_job_state(job_id).await?;
        if state.state.is_terminal() {
            return Err(RequesterError::JobTerminated(job_id.to_string()));
        }

        for execution in state.active_executions() {
            let request = UpdateExecutionRequest::transition(
                job_id,
                &execution.id,
                ExecutionStateType::Cancelled,
            )
            .with_status(reason);
            if self.store.update_execution(request).await.is_ok() {
                out.push(
                    JobEvent::new(EventName::CancelExecution, job_id, &self.host_id)
                        .with_target(&execution.node_id)
                        .with_payload(&CancelPayload { reason: reason.to_string() }),
                );
            }
        }

        self.store
            .update_job_state(UpdateJobStateRequest {
                job_id: job_id.to_string(),
                new_state: JobStateType::Cancelled,
                status: Some(reason.to_string()),
                expected_version: None,
            })
            .await?;
        out.push(
            JobEvent::new(EventName::Cancelled, job_id, &self.host_id)
                .with_payload(&CancelPayload { reason: reason.to_string() }),
        );
        tracing::info!(job_id = %job_id, reason = %reason, "Job cancelled");
        Ok(())
    }

    /// Entry point from the event plane: apply the event's local effect, then
    /// reconcile.
    pub async fn on_event(&self, event: JobEvent) {
        if !event.is_broadcast() && event.target_node_id != self.host_id {
            return;
        }
        if !matches!(
            event.event_name,
            EventName::BidReceived
                | EventName::BidCancelled
                | EventName::ComputeError
                | EventName::ResultProposed
                | EventName::Published
                | EventName::Cancelled
        ) {
            return;
        }

        let job_id = event.job_id.clone();
        let mut out = Vec::new();
        {
            let _guard = self.locks.lock(&job_id).await;

            let state = match self.store.get_job_state(&job_id).await {
                Ok(state) => state,
                Err(_) => {
                    tracing::debug!(job_id = %job_id, event = %event.event_name, "Event for unknown job, ignoring");
                    return;
                }
            };
            if state.state.is_terminal() {
                tracing::debug!(job_id = %job_id, state = %state.state, "Event for terminal job, ignoring");
                return;
            }

            self.store.append_event(event.clone()).await;
            self.apply_effect(&event, &state, &mut out).await;
            self.transition_locked(&job_id, &mut out).await;
        }
        self.flush(out).await;
    }

    /// The event → store-effect table. Unknown or stale events are dropped;
    /// reapplying an already-applied event is a no-op.
    async fn apply_effect(&self, event: &JobEvent, state: &JobState, out: &mut Vec<JobEvent>) {
        let job_id = &event.job_id;
        let node = &event.source_node_id;

        let applied = match event.event_name {
            EventName::BidReceived => {
                let execution_id = event.payload_as::<BidPayload>().map(|p| p.execution_id);
                self.advance_execution(
                    state,
                    execution_id,
                    node,
                    ExecutionStateType::AskedToBid,
                    UpdateExecutionRequest::transition(job_id, "", ExecutionStateType::BidReceived),
                )
                .await
            }
            EventName::BidCancelled => {
                let execution_id = event.payload_as::<BidPayload>().map(|p| p.execution_id);
                self.fail_execution(state, execution_id, node, "bid withdrawn").await
            }
            EventName::ComputeError => {
                let payload = event.payload_as::<ComputeErrorPayload>();
                let (execution_id, error) = match payload {
                    Some(p) => (Some(p.execution_id), p.error),
                    None => (None, "compute error".to_string()),
                };
                self.fail_execution(state, execution_id, node, &error).await
            }
            EventName::ResultProposed => {
                let payload = event.payload_as::<ResultProposedPayload>();
                let (execution_id, proposal) = match payload {
                    Some(p) => (Some(p.execution_id), p.proposal),
                    None => (None, vec![]),
                };
                let mut request = UpdateExecutionRequest::transition(
                    job_id,
                    "",
                    ExecutionStateType::ResultProposed,
                );
                request.result_proposal = Some(proposal);
                self.advance_execution(
                    state,
                    execution_id,
                    node,
                    ExecutionStateType::BidAccepted,
                    request,
                )
                .await
            }
            EventName::Published => {
                let payload = event.payload_as::<PublishedPayload>();
                let (execution_id, result) = match payload {
                    Some(p) => (
                        Some(p.execution_id),
                        serde_json::from_value::<StorageRef>(p.result).ok(),
                    ),
                    None => (None, None),
                };
                let mut request = UpdateExecutionRequest::transition(
                    job_id,
                    "",
                    ExecutionStateType::Completed,
                );
                request.published_result = result;
                self.advance_execution(
                    state,
                    execution_id,
                    node,
                    ExecutionStateType::ResultAccepted,
                    request,
                )
                .await
            }
            EventName::Cancelled => {
                let reason = event
                    .payload_as::<CancelPayload>()
                    .map(|p| p.reason)
                    .unwrap_or_else(|| "cancelled".to_string());
                if let Err(e) = self.cancel_locked(job_id, &reason, out).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Cancel event had no effect");
                }
                return;
            }
            _ => false,
        };

        if !applied {
            tracing::debug!(
                job_id = %job_id,
                event = %event.event_name,
                node = %node,
                "Event had no matching execution, dropped"
            );
        }
    }

    /// Move the node's execution forward if it sits in the expected state.
    /// Returns false when there is nothing to advance (duplicate or stale
    /// event, or a result from a node whose bid was rejected).
    async fn advance_execution(
        &self,
        state: &JobState,
        execution_id: Option<String>,
        node: &str,
        expected: ExecutionStateType,
        mut request: UpdateExecutionRequest,
    ) -> bool {
        let found = Self::find_execution(state, execution_id.as_deref(), node, Some(expected));
        let Some(execution) = found else {
            return false;
        };
        request.execution_id = execution.id.clone();
        match self.store.update_execution(request).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(execution_id = %execution.id, error = %e, "Execution update rejected");
                false
            }
        }
    }

    async fn fail_execution(
        &self,
        state: &JobState,
        execution_id: Option<String>,
        node: &str,
        status: &str,
    ) -> bool {
        let found = Self::find_execution(state, execution_id.as_deref(), node, None);
        let Some(execution) = found else {
            return false;
        };
        let request = UpdateExecutionRequest::transition(
            &state.job_id,
            &execution.id,
            ExecutionStateType::Failed,
        )
        .with_status(status);
        self.store.update_execution(request).await.is_ok()
    }

    /// Prefer the execution named by the payload when it belongs to the
    /// sending node; otherwise fall back to the node's execution in the
    /// expected state (any live one when no state is expected).
    fn find_execution<'a>(
        state: &'a JobState,
        execution_id: Option<&str>,
        node: &str,
        expected: Option<ExecutionStateType>,
    ) -> Option<&'a Execution> {
        let accepts = |e: &Execution| match expected {
            Some(want) => e.state == want,
            None => !e.state.is_terminal(),
        };
        if let Some(id) = execution_id {
            if let Some(execution) = state.execution(id) {
                if execution.node_id == node && accepts(execution) {
                    return Some(execution);
                }
            }
        }
        state
            .executions
            .iter()
            .find(|e| e.node_id == node && accepts(e))
    }

    /// Reconcile a job: idempotent, callable from event handling or from the
    /// periodic sweep.
    pub async fn transition_job_state(&self, job_id: &str) {
        let mut out = Vec::new();
        {
            let _guard = self.locks.lock(job_id).await;
            self.transition_locked(job_id, &mut out).await;
        }
        self.flush(out).await;
    }

    async fn transition_locked(&self, job_id: &str, out: &mut Vec<JobEvent>) {
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
                return;
            }
        };

        // Result rejections feed back into retry selection, hence the loop.
        loop {
            let state = match self.store.get_job_state(job_id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to load job state");
                    return;
                }
            };
            if state.state.is_terminal() {
                tracing::debug!(job_id = %job_id, state = %state.state, "Job already terminal");
                return;
            }

            let roster = self.roster.roster().await;

            // 1. Failed executions: retry on alternate nodes or give up.
            match self.selector.select_nodes_for_retry(&job, &state, &roster) {
                Err(e) => {
                    if self.config.fail_on_selector_error {
                        self.stop_job_locked(
                            job_id,
                            &format!("node selection failed: {e}"),
                            true,
                            out,
                        )
                        .await;
                    } else {
                        tracing::error!(job_id = %job_id, error = %e, "Retry selection failed, will retry on next sweep");
                    }
                    return;
                }
                Ok(nodes_to_retry) => {
                    let can_retry = self.retry.should_retry(&RetryRequest {
                        job_id: job_id.to_string(),
                        attempts: state.executions.len() as u32,
                        concurrency: job.deal.concurrency,
                    });
                    if !nodes_to_retry.is_empty() && !can_retry {
                        let message = Self::aggregate_failures(&state);
                        self.stop_job_locked(job_id, &message, false, out).await;
                        return;
                    }
                    for node in &nodes_to_retry {
                        if let Err(e) = self.ask_node_for_bid(&job, node, out).await {
                            tracing::error!(job_id = %job_id, node = %node, error = %e, "Failed to create retry execution");
                        } else {
                            tracing::info!(job_id = %job_id, node = %node, "Retrying on alternate node");
                        }
                    }
                }
            }

            // 2. Pending bids.
            let state = match self.store.get_job_state(job_id).await {
                Ok(state) => state,
                Err(_) => return,
            };
            let (accept, reject) = self.selector.select_bids(&job, &state, &roster, Utc::now());
            for execution_id in accept {
                self.adjudicate_bid(job_id, &execution_id, true, out).await;
            }
            for execution_id in reject {
                self.adjudicate_bid(job_id, &execution_id, false, out).await;
            }

            // 3. Pending results.
            let state = match self.store.get_job_state(job_id).await {
                Ok(state) => state,
                Err(_) => return,
            };
            let proposed: Vec<Execution> = state
                .executions_in(ExecutionStateType::ResultProposed)
                .into_iter()
                .cloned()
                .collect();
            if !proposed.is_empty() {
                match self.verifier.verify(&job, &proposed).await {
                    Err(e) if e.is_insufficient() => {
                        tracing::debug!(job_id = %job_id, "Verifier wants more executions, waiting");
                        return;
                    }
                    Err(e) => {
                        self.stop_job_locked(
                            job_id,
                            &format!("failed to verify job {job_id}: {e}"),
                            true,
                            out,
                        )
                        .await;
                        return;
                    }
                    Ok(partition) => {
                        tracing::debug!(
                            job_id = %job_id,
                            succeeded = partition.succeeded.len(),
                            failed = partition.failed.len(),
                            "Verified results"
                        );
                        for execution_id in &partition.succeeded {
                            self.adjudicate_result(job_id, execution_id, true, out).await;
                        }
                        for execution_id in &partition.failed {
                            self.adjudicate_result(job_id, execution_id, false, out).await;
                        }
                        if !partition.failed.is_empty() {
                            // Run retry selection over the fresh rejections
                            continue;
                        }
                    }
                }
            }

            // 4. Completed executions.
            let state = match self.store.get_job_state(job_id).await {
                Ok(state) => state,
                Err(_) => return,
            };
            if let Some(new_state) = self.selector.can_complete_job(&job, &state) {
                let update = UpdateJobStateRequest {
                    job_id: job_id.to_string(),
                    new_state,
                    status: None,
                    expected_version: Some(state.version),
                };
                match self.store.update_job_state(update).await {
                    Ok(_) => {
                        if new_state == JobStateType::CompletedPartially {
                            tracing::info!(job_id = %job_id, "Job completed partially with some failed executions");
                        } else {
                            tracing::info!(job_id = %job_id, "Job completed successfully");
                        }
                    }
                    Err(RequesterError::ConcurrentUpdate { .. }) => {
                        // Someone moved the state under us; reconcile again
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to complete job");
                    }
                }
            }
            return;
        }
    }

    async fn adjudicate_bid(
        &self,
        job_id: &str,
        execution_id: &str,
        accept: bool,
        out: &mut Vec<JobEvent>,
    ) {
        let (new_state, event_name, status) = if accept {
            (ExecutionStateType::BidAccepted, EventName::BidAccepted, "bid accepted")
        } else {
            (ExecutionStateType::BidRejected, EventName::BidRejected, "bid rejected")
        };
        let request =
            UpdateExecutionRequest::transition(job_id, execution_id, new_state).with_status(status);
        match self.store.update_execution(request).await {
            Ok(execution) => {
                out.push(
                    JobEvent::new(event_name, job_id, &self.host_id)
                        .with_target(&execution.node_id)
                        .with_payload(&BidPayload { execution_id: execution.id }),
                );
            }
            Err(e) => {
                tracing::debug!(execution_id = %execution_id, error = %e, "Bid adjudication skipped");
            }
        }
    }

    async fn adjudicate_result(
        &self,
        job_id: &str,
        execution_id: &str,
        accept: bool,
        out: &mut Vec<JobEvent>,
    ) {
        let (new_state, event_name, status) = if accept {
            (ExecutionStateType::ResultAccepted, EventName::ResultAccepted, "result accepted")
        } else {
            (ExecutionStateType::ResultRejected, EventName::ResultRejected, "result rejected")
        };
        let request =
            UpdateExecutionRequest::transition(job_id, execution_id, new_state).with_status(status);
        match self.store.update_execution(request).await {
            Ok(execution) => {
                out.push(
                    JobEvent::new(event_name, job_id, &self.host_id)
                        .with_target(&execution.node_id)
                        .with_payload(&BidPayload { execution_id: execution.id }),
                );
            }
            Err(e) => {
                tracing::debug!(execution_id = %execution_id, error = %e, "Result adjudication skipped");
            }
        }
    }

    fn aggregate_failures(state: &JobState) -> String {
        let mut failures: Vec<&Execution> = state
            .executions
            .iter()
            .filter(|e| e.state == ExecutionStateType::Failed)
            .collect();
        failures.sort_by_key(|e| e.update_time);
        let parts: Vec<String> = failures
            .iter()
            .map(|e| format!("node {} failed due to: {}", e.node_id, e.status))
            .collect();
        if parts.is_empty() {
            "retry budget exhausted".to_string()
        } else {
            parts.join("; ")
        }
    }

    /// Terminate a job: fail the state, cancel every live execution and tell
    /// its node.
    async fn stop_job_locked(
        &self,
        job_id: &str,
        message: &str,
        permanent: bool,
        out: &mut Vec<JobEvent>,
    ) {
        let Ok(state) = self.store.get_job_state(job_id).await else {
            return;
        };

        for execution in state.active_executions() {
            let request = UpdateExecutionRequest::transition(
                job_id,
                &execution.id,
                ExecutionStateType::Cancelled,
            )
            .with_status("job stopped");
            if self.store.update_execution(request).await.is_ok() {
                out.push(
                    JobEvent::new(EventName::CancelExecution, job_id, &self.host_id)
                        .with_target(&execution.node_id)
                        .with_payload(&CancelPayload { reason: message.to_string() }),
                );
            }
        }

        let update = UpdateJobStateRequest {
            job_id: job_id.to_string(),
            new_state: JobStateType::Failed,
            status: Some(message.to_string()),
            expected_version: None,
        };
        if let Err(e) = self.store.update_job_state(update).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
        }
        tracing::warn!(job_id = %job_id, permanent, "Job stopped: {message}");
    }

    /// Record outbound events and hand them to the transport without waiting
    /// for delivery.
    async fn flush(&self, events: Vec<JobEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            self.store.append_event(event.clone()).await;
        }
        let transport = self.transport.clone();
        tokio::spawn(async move {
            for event in events {
                if let Err(e) = transport.publish(event).await {
                    tracing::warn!(error = %e, "Transport publish failed");
                }
            }
        });
    }

    /// Subscribe to the transport through a bounded queue and spawn the worker
    /// that drains it. Transport threads never run scheduler code directly.
    pub fn start_event_worker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<JobEvent>(self.config.inbound_queue_size);
        self.transport.subscribe(Arc::new(move |event| {
            if tx.try_send(event).is_err() {
                tracing::warn!("Inbound event queue full, dropping newest event");
            }
        }));

        let scheduler = self;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                scheduler.on_event(event).await;
            }
        })
    }

    /// One pass of the stale-job sweep.
    pub async fn sweep_once(&self) {
        for job_id in self.store.non_terminal_jobs().await {
            self.transition_job_state(&job_id).await;

            let mut out = Vec::new();
            {
                let _guard = self.locks.lock(&job_id).await;
                if let Ok(state) = self.store.get_job_state(&job_id).await {
                    if !state.state.is_terminal() && state.active_executions().is_empty() {
                        self.stop_job_locked(&job_id, "no live executions", true, &mut out).await;
                    }
                }
            }
            self.flush(out).await;
        }
    }

    /// Reconcile every non-terminal job on a timer, forever.
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let mut timer = tokio::time::interval(self.config.sweep_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            self.sweep_once().await;
        }
    }
}
