mod common;

use std::sync::Arc;
use std::time::Duration;

use armada_protocol::{
    BidPayload, ComputeErrorPayload, EventName, JobEvent, ResultProposedPayload, Transport,
};
use armada_requester::model::{ExecutionStateType, JobStateType};
use armada_requester::retry::{FixedBudgetRetry, NoRetry};
use armada_requester::selector::SelectorConfig;
use armada_requester::store::JobStore;
use armada_requester::verifier::TrustedVerifier;

use common::*;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn happy_path_single_concurrency() {
    let h = harness(
        &["node-a"],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig::default(),
    );
    spawn_compute_stub(&h.bus, "node-a", StubBehavior::Publish(b"result".to_vec()));

    let job = h.scheduler.submit(noop_job(1, 1, 1)).await.unwrap();
    let state = wait_for_state(&h.store, &job.id, JobStateType::CompletedSuccessfully, WAIT).await;

    assert_eq!(state.executions.len(), 1);
    assert_eq!(state.executions[0].state, ExecutionStateType::Completed);
    assert!(state.executions[0].published_result.is_some());

    let mut names: Vec<String> = h
        .store
        .events(&job.id)
        .await
        .iter()
        .map(|e| e.event_name.to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "AskForBid",
            "BidAccepted",
            "BidReceived",
            "Created",
            "Published",
            "ResultAccepted",
            "ResultProposed",
        ]
    );
}

#[tokio::test]
async fn partial_completion_when_one_node_keeps_failing() {
    let h = harness(
        &["node-a", "node-b", "node-c"],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig::default(),
    );
    spawn_compute_stub(&h.bus, "node-a", StubBehavior::Publish(b"ok".to_vec()));
    spawn_compute_stub(&h.bus, "node-b", StubBehavior::Publish(b"ok".to_vec()));
    spawn_compute_stub(&h.bus, "node-c", StubBehavior::FailCompute("disk on fire".into()));

    let job = h.scheduler.submit(noop_job(3, 2, 3)).await.unwrap();
    let state = wait_for_state(&h.store, &job.id, JobStateType::CompletedPartially, WAIT).await;

    assert_eq!(state.count_in(ExecutionStateType::Completed), 2);
    assert_eq!(state.count_in(ExecutionStateType::Failed), 1);
}

#[tokio::test]
async fn retry_moves_to_an_alternate_node() {
    // Fan-out of one: only node-a is asked initially, node-b is the spare.
    let h = harness(
        &["node-a", "node-b"],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig { ask_fanout: 1, ..Default::default() },
    );
    spawn_compute_stub(&h.bus, "node-a", StubBehavior::FailCompute("oom".into()));
    spawn_compute_stub(&h.bus, "node-b", StubBehavior::Publish(b"ok".to_vec()));

    let job = h.scheduler.submit(noop_job(1, 1, 1)).await.unwrap();
    let state = wait_for_state(&h.store, &job.id, JobStateType::CompletedSuccessfully, WAIT).await;

    assert_eq!(state.executions.len(), 2);
    let by_node = |node: &str| {
        state
            .executions
            .iter()
            .find(|e| e.node_id == node)
            .expect("execution")
            .state
    };
    assert_eq!(by_node("node-a"), ExecutionStateType::Failed);
    assert_eq!(by_node("node-b"), ExecutionStateType::Completed);
}

#[tokio::test]
async fn retry_budget_exhaustion_stops_the_job() {
    // Four nodes, so an untried candidate exists when node-a's run fails,
    // but the strategy forbids spending it.
    let h = harness(
        &["node-a", "node-b", "node-c", "node-d"],
        Arc::new(TrustedVerifier),
        Arc::new(NoRetry),
        SelectorConfig::default(),
    );
    for node in ["node-a", "node-b", "node-c", "node-d"] {
        spawn_compute_stub(&h.bus, node, StubBehavior::FailCompute("boom".into()));
    }

    let job = h.scheduler.submit(noop_job(1, 1, 1)).await.unwrap();
    let state = wait_for_state(&h.store, &job.id, JobStateType::Failed, WAIT).await;

    assert!(
        state.status.contains("failed due to: boom"),
        "status should aggregate the failure reasons, got: {}",
        state.status
    );
}

#[tokio::test]
async fn duplicate_bid_events_are_idempotent() {
    let h = harness(
        &["node-a"],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig::default(),
    );

    let job = h.scheduler.submit(noop_job(1, 1, 1)).await.unwrap();
    settle().await;

    let ask = h
        .bus
        .events()
        .into_iter()
        .find(|e| e.event_name == EventName::AskForBid)
        .expect("ask was published");
    let execution_id = ask
        .payload_as::<armada_protocol::AskForBidPayload>()
        .unwrap()
        .execution_id;

    let bid = JobEvent::new(EventName::BidReceived, &job.id, "node-a")
        .with_target(REQUESTER)
        .with_payload(&BidPayload { execution_id: execution_id.clone() });
    h.bus.publish(bid.clone()).await.unwrap();
    settle().await;
    let once = h.store.get_job_state(&job.id).await.unwrap();

    h.bus.publish(bid).await.unwrap();
    settle().await;
    let twice = h.store.get_job_state(&job.id).await.unwrap();

    assert_eq!(once.executions.len(), 1);
    assert_eq!(twice.executions.len(), 1);
    assert_eq!(once.executions[0].state, twice.executions[0].state);
    // The bid was accepted exactly once
    let accepted: Vec<JobEvent> = h
        .store
        .events(&job.id)
        .await
        .into_iter()
        .filter(|e| e.event_name == EventName::BidAccepted)
        .collect();
    assert_eq!(accepted.len(), 1);
}

#[tokio::test]
async fn results_from_rejected_bidders_are_ignored() {
    // One slot, two bidders: one bid gets rejected, and whatever that node
    // sends afterwards must not move its execution.
    let h = harness(
        &["node-a", "node-b"],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig::default(),
    );
    spawn_compute_stub(&h.bus, "node-a", StubBehavior::BidOnly);
    spawn_compute_stub(&h.bus, "node-b", StubBehavior::BidOnly);

    let job = h.scheduler.submit(noop_job(1, 1, 2)).await.unwrap();
    settle().await;

    let state = h.store.get_job_state(&job.id).await.unwrap();
    let rejected = state
        .executions
        .iter()
        .find(|e| e.state == ExecutionStateType::BidRejected)
        .expect("one bid should be rejected");

    let rogue = JobEvent::new(EventName::ResultProposed, &job.id, &rejected.node_id)
        .with_target(REQUESTER)
        .with_payload(&ResultProposedPayload {
            execution_id: rejected.id.clone(),
            proposal: b"sneaky".to_vec(),
        });
    h.bus.publish(rogue).await.unwrap();
    settle().await;

    let after = h.store.get_job_state(&job.id).await.unwrap();
    let execution = after.execution(&rejected.id).unwrap();
    assert_eq!(execution.state, ExecutionStateType::BidRejected);
    assert!(execution.result_proposal.is_none());
}

#[tokio::test]
async fn cancel_stops_live_executions() {
    let h = harness(
        &["node-a"],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig::default(),
    );
    spawn_compute_stub(&h.bus, "node-a", StubBehavior::BidOnly);

    let job = h.scheduler.submit(noop_job(1, 1, 1)).await.unwrap();
    settle().await;

    h.scheduler.cancel(&job.id, "changed my mind").await.unwrap();
    let state = wait_for_state(&h.store, &job.id, JobStateType::Cancelled, WAIT).await;

    assert!(state
        .executions
        .iter()
        .all(|e| e.state == ExecutionStateType::Cancelled));
    let cancels = h
        .bus
        .events()
        .into_iter()
        .filter(|e| e.event_name == EventName::CancelExecution)
        .count();
    assert!(cancels >= 1, "nodes must be told to stop");
}

#[tokio::test]
async fn events_for_terminal_jobs_change_nothing() {
    let h = harness(
        &["node-a"],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig::default(),
    );
    spawn_compute_stub(&h.bus, "node-a", StubBehavior::Publish(b"ok".to_vec()));

    let job = h.scheduler.submit(noop_job(1, 1, 1)).await.unwrap();
    let done = wait_for_state(&h.store, &job.id, JobStateType::CompletedSuccessfully, WAIT).await;

    let late = JobEvent::new(EventName::ComputeError, &job.id, "node-a")
        .with_target(REQUESTER)
        .with_payload(&ComputeErrorPayload {
            execution_id: done.executions[0].id.clone(),
            error: "too late".into(),
        });
    h.bus.publish(late).await.unwrap();
    settle().await;

    let after = h.store.get_job_state(&job.id).await.unwrap();
    assert_eq!(after.state, JobStateType::CompletedSuccessfully);
    assert_eq!(after.version, done.version);
}

#[tokio::test]
async fn sweep_stops_jobs_with_no_live_executions() {
    // Empty roster: the job is admitted but nobody can be asked.
    let h = harness(
        &[],
        Arc::new(TrustedVerifier),
        Arc::new(FixedBudgetRetry::default()),
        SelectorConfig::default(),
    );

    let job = h.scheduler.submit(noop_job(1, 1, 1)).await.unwrap();
    h.scheduler.sweep_once().await;

    let state = h.store.get_job_state(&job.id).await.unwrap();
    assert_eq!(state.state, JobStateType::Failed);
    assert_eq!(state.status, "no live executions");
}
