#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use armada_protocol::{
    AskForBidPayload, BidPayload, ComputeErrorPayload, EventName, InProcessTransport, JobEvent,
    NodeResources, PublishedPayload, ResultProposedPayload, Transport,
};
use armada_requester::model::*;
use armada_requester::retry::RetryStrategy;
use armada_requester::scheduler::{BaseScheduler, SchedulerConfig, StaticRoster};
use armada_requester::selector::{NodeRank, NodeSelector, SelectorConfig};
use armada_requester::sharding::ExecutionPlan;
use armada_requester::store::{InMemoryJobStore, JobStore};
use armada_requester::verifier::Verifier;

pub const REQUESTER: &str = "requester";

pub struct Harness {
    pub bus: InProcessTransport,
    pub store: Arc<InMemoryJobStore>,
    pub scheduler: Arc<BaseScheduler>,
}

/// Wire a scheduler to an in-process bus and a fixed roster.
pub fn harness(
    nodes: &[&str],
    verifier: Arc<dyn Verifier>,
    retry: Arc<dyn RetryStrategy>,
    selector: SelectorConfig,
) -> Harness {
    let bus = InProcessTransport::new(REQUESTER);
    let store = Arc::new(InMemoryJobStore::new());
    let roster = StaticRoster(
        nodes
            .iter()
            .map(|node| {
                NodeRank::new(
                    node.to_string(),
                    NodeResources {
                        cpu_millis: 4000,
                        memory_bytes: 4 << 30,
                        gpu_units: 1,
                    },
                )
            })
            .collect(),
    );

    let store_handle: Arc<dyn JobStore> = store.clone();
    let scheduler = BaseScheduler::new(
        REQUESTER,
        store_handle,
        Arc::new(bus.clone()),
        verifier,
        retry,
        Arc::new(roster),
        NodeSelector::new(selector),
        SchedulerConfig {
            sweep_interval: Duration::from_millis(50),
            ..Default::default()
        },
    );
    scheduler.clone().start_event_worker();

    Harness { bus, store, scheduler }
}

/// How a scripted compute node behaves once its bid is accepted.
pub enum StubBehavior {
    /// Propose this result, then publish when the proposal is accepted
    Publish(Vec<u8>),
    /// Report a compute error
    FailCompute(String),
    /// Bid and then go silent
    BidOnly,
}

/// A scripted compute node on the in-process bus: bids on every ask and then
/// follows its behavior.
pub fn spawn_compute_stub(bus: &InProcessTransport, node_id: &str, behavior: StubBehavior) {
    let node = node_id.to_string();
    let handle = bus.for_node(&node);
    let behavior = Arc::new(behavior);

    bus.subscribe(Arc::new(move |event: JobEvent| {
        if event.target_node_id != node {
            return;
        }
        let bus = handle.clone();
        let node = node.clone();
        let behavior = behavior.clone();
        tokio::spawn(async move {
            let requester = event.source_node_id.clone();
            let job_id = event.job_id.clone();
            match event.event_name {
                EventName::AskForBid => {
                    let Some(payload) = event.payload_as::<AskForBidPayload>() else {
                        return;
                    };
                    let reply = JobEvent::new(EventName::BidReceived, &job_id, &node)
                        .with_target(&requester)
                        .with_payload(&BidPayload { execution_id: payload.execution_id });
                    bus.publish(reply).await.ok();
                }
                EventName::BidAccepted => {
                    let Some(payload) = event.payload_as::<BidPayload>() else {
                        return;
                    };
                    match behavior.as_ref() {
                        StubBehavior::Publish(bytes) => {
                            let reply = JobEvent::new(EventName::ResultProposed, &job_id, &node)
                                .with_target(&requester)
                                .with_payload(&ResultProposedPayload {
                                    execution_id: payload.execution_id,
                                    proposal: bytes.clone(),
                                });
                            bus.publish(reply).await.ok();
                        }
                        StubBehavior::FailCompute(message) => {
                            let reply = JobEvent::new(EventName::ComputeError, &job_id, &node)
                                .with_target(&requester)
                                .with_payload(&ComputeErrorPayload {
                                    execution_id: payload.execution_id,
                                    error: message.clone(),
                                });
                            bus.publish(reply).await.ok();
                        }
                        StubBehavior::BidOnly => {}
                    }
                }
                EventName::ResultAccepted => {
                    if matches!(behavior.as_ref(), StubBehavior::Publish(_)) {
                        let Some(payload) = event.payload_as::<BidPayload>() else {
                            return;
                        };
                        let reply = JobEvent::new(EventName::Published, &job_id, &node)
                            .with_target(&requester)
                            .with_payload(&PublishedPayload {
                                execution_id: payload.execution_id,
                                result: serde_json::json!({
                                    "source": "ipfs",
                                    "cid": format!("Qm{node}"),
                                    "path": "/outputs",
                                }),
                            });
                        bus.publish(reply).await.ok();
                    }
                }
                _ => {}
            }
        });
    }));
}

pub fn noop_spec() -> JobSpec {
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

pub fn noop_job(concurrency: u32, confidence: u32, min_bids: u32) -> Job {
    Job::admit(
        noop_spec(),
        Deal { concurrency, confidence, min_bids },
        ExecutionPlan::default(),
    )
    .unwrap()
}

/// Poll until the job reaches the wanted state, or panic with the last state
/// seen.
pub async fn wait_for_state(
    store: &Arc<InMemoryJobStore>,
    job_id: &str,
    want: JobStateType,
    timeout: Duration,
) -> JobState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = store.get_job_state(job_id).await.expect("job state");
        if state.state == want {
            return state;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "job {job_id} never reached {want}: stuck in {} ({})",
                state.state, state.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give in-flight event handling a moment to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
