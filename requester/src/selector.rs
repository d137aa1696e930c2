use armada_protocol::{NodeId, NodeResources};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::Result;
use crate::model::*;

/// A discovered node as the selector sees it: advertised resources, labels
/// and current load (assigned active executions).
#[derive(Debug, Clone)]
pub struct NodeRank {
    pub node_id: NodeId,
    pub resources: NodeResources,
    pub labels: HashMap<String, String>,
    pub load: u32,
}

impl NodeRank {
    pub fn new(node_id: impl Into<NodeId>, resources: NodeResources) -> Self {
        Self {
            node_id: node_id.into(),
            resources,
            labels: HashMap::new(),
            load: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Ask `concurrency × ask_fanout` nodes for bids (at least `min_bids`)
    pub ask_fanout: u32,
    /// How long to hold out for `min_bids` before adjudicating what we have
    pub min_bids_deadline: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            ask_fanout: 3,
            min_bids_deadline: Duration::from_secs(30),
        }
    }
}

/// Pure node-selection policies. No IO; every decision is a function of the
/// job, its state, the roster and the clock the caller passes in.
#[derive(Debug, Clone, Default)]
pub struct NodeSelector {
    config: SelectorConfig,
}

impl NodeSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Roster nodes that match the job's selectors and can fit its resource
    /// request, best first: lower load, then lexical node id.
    fn matching<'a>(&self, job: &Job, roster: &'a [NodeRank]) -> Vec<&'a NodeRank> {
        let mut nodes: Vec<&NodeRank> = roster
            .iter()
            .filter(|n| n.resources.fits(&job.spec.resources))
            .filter(|n| job.spec.node_selectors.iter().all(|req| req.matches(&n.labels)))
            .collect();
        nodes.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.node_id.cmp(&b.node_id)));
        nodes
    }

    /// Which nodes to ask for bids at submission.
    pub fn select_nodes_for_ask(&self, job: &Job, roster: &[NodeRank]) -> Result<Vec<NodeId>> {
        let want = (job.deal.concurrency * self.config.ask_fanout).max(job.deal.min_bids) as usize;
        Ok(self
            .matching(job, roster)
            .into_iter()
            .take(want)
            .map(|n| n.node_id.clone())
            .collect())
    }

    /// Adjudicate pending bids: once `min_bids` have arrived (or the deadline
    /// has passed), accept the best bids up to the job's remaining concurrency
    /// and reject the rest. Under `min_bids` and before the deadline, hold.
    pub fn select_bids(
        &self,
        job: &Job,
        state: &JobState,
        roster: &[NodeRank],
        now: DateTime<Utc>,
    ) -> (Vec<ExecutionId>, Vec<ExecutionId>) {
        let mut bids: Vec<&Execution> = Vec::new();
        let mut seen_nodes: HashSet<&str> = HashSet::new();
        for execution in state.executions_in(ExecutionStateType::BidReceived) {
            // A node only ever counts once toward min_bids
            if seen_nodes.insert(execution.node_id.as_str()) {
                bids.push(execution);
            }
        }
        if bids.is_empty() {
            return (vec![], vec![]);
        }

        let deadline = state.create_time
            + chrono::Duration::from_std(self.config.min_bids_deadline)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        if (bids.len() as u32) < job.deal.min_bids && now < deadline {
            return (vec![], vec![]);
        }

        // Slots already committed to other bids
        let committed = state.count_in(ExecutionStateType::BidAccepted)
            + state.count_in(ExecutionStateType::ResultProposed)
            + state.count_in(ExecutionStateType::ResultAccepted)
            + state.count_in(ExecutionStateType::Completed);
        let open = (job.deal.concurrency as usize).saturating_sub(committed);

        // Best bids first, by the roster ordering; bidders we no longer know rank last
        let rank: HashMap<&str, usize> = self
            .matching(job, roster)
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id.as_str(), i))
            .collect();
        bids.sort_by_key(|e| {
            (
                rank.get(e.node_id.as_str()).copied().unwrap_or(usize::MAX),
                e.node_id.clone(),
            )
        });

        let accept = bids.iter().take(open).map(|e| e.id.clone()).collect();
        let reject = bids.iter().skip(open).map(|e| e.id.clone()).collect();
        (accept, reject)
    }

    /// Alternate nodes for failed executions: one untried node per open slot.
    pub fn select_nodes_for_retry(
        &self,
        job: &Job,
        state: &JobState,
        roster: &[NodeRank],
    ) -> Result<Vec<NodeId>> {
        let failed = state.count_in(ExecutionStateType::Failed)
            + state.count_in(ExecutionStateType::ResultRejected);
        if failed == 0 {
            return Ok(vec![]);
        }

        let progressing = state
            .executions
            .iter()
            .filter(|e| {
                !e.state.is_terminal() || e.state == ExecutionStateType::Completed
            })
            .count();
        let deficit = (job.deal.concurrency as usize).saturating_sub(progressing);
        if deficit == 0 {
            return Ok(vec![]);
        }

        let tried: HashSet<&str> = state.tried_nodes().into_iter().collect();
        Ok(self
            .matching(job, roster)
            .into_iter()
            .filter(|n| !tried.contains(n.node_id.as_str()))
            .take(deficit)
            .map(|n| n.node_id.clone())
            .collect())
    }

    /// Whether the job can be declared done, and in which terminal state.
    ///
    /// Success needs `concurrency` completed executions. Partial success needs
    /// `confidence`, no live executions, and nothing left for the retry path
    /// to do (the reconciliation loop runs retries first, so reaching this
    /// with no live executions means no further progress is possible).
    pub fn can_complete_job(&self, job: &Job, state: &JobState) -> Option<JobStateType> {
        let completed = state.count_in(ExecutionStateType::Completed);
        if completed >= job.deal.concurrency as usize {
            return Some(JobStateType::CompletedSuccessfully);
        }
        if state.active_executions().is_empty()
            && completed >= job.deal.confidence as usize
            && completed < job.deal.concurrency as usize
        {
            return Some(JobStateType::CompletedPartially);
        }
        None
    }
}
