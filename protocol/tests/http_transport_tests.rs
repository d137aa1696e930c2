use std::sync::{Arc, Mutex};
use std::time::Duration;

use armada_protocol::{
    EventName, HttpTransport, JobEvent, NodeResources, Transport, TransportConfig,
};

fn config(node_id: &str, public_addr: String, seeds: Vec<String>) -> TransportConfig {
    TransportConfig {
        node_id: node_id.to_string(),
        listen_addr: String::new(), // the test binds its own listeners
        public_addr,
        seed_peers: seeds,
        resources: NodeResources {
            cpu_millis: 1000,
            memory_bytes: 1 << 30,
            gpu_units: 0,
        },
        ..Default::default()
    }
}

fn spawn_endpoint(transport: &HttpTransport, listener: tokio::net::TcpListener) {
    let app = transport.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
}

#[tokio::test]
async fn peers_discover_each_other_and_exchange_events() {
    let listener_a = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = listener_a.local_addr().unwrap().to_string();
    let addr_b = listener_b.local_addr().unwrap().to_string();

    let a = HttpTransport::new(config("node-a", addr_a.clone(), vec![]));
    let b = HttpTransport::new(config("node-b", addr_b, vec![addr_a]));

    spawn_endpoint(&a, listener_a);
    spawn_endpoint(&b, listener_b);

    let received = Arc::new(Mutex::new(Vec::<JobEvent>::new()));
    let sink = received.clone();
    b.subscribe(Arc::new(move |event| sink.lock().unwrap().push(event)));

    // B announces to its seed; both registries end up knowing the other side
    b.bootstrap().await.unwrap();
    assert_eq!(b.peers().count().await, 1);
    assert_eq!(a.peers().count().await, 1);

    for i in 0..3 {
        let event = JobEvent::new(EventName::AskForBid, format!("job-{i}"), "node-a")
            .with_target("node-b");
        a.publish(event).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if received.lock().unwrap().len() == 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "events never arrived at node-b"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // One outbound worker per peer keeps per-pair FIFO order
    let jobs: Vec<String> = received.lock().unwrap().iter().map(|e| e.job_id.clone()).collect();
    assert_eq!(jobs, vec!["job-0", "job-1", "job-2"]);
}

#[tokio::test]
async fn publish_after_disconnect_fails() {
    let transport = HttpTransport::new(config("node-a", "127.0.0.1:1".into(), vec![]));
    transport.disconnect().await;
    let err = transport
        .publish(JobEvent::new(EventName::Created, "job", "node-a").with_target("node-b"))
        .await
        .unwrap_err();
    assert!(matches!(err, armada_protocol::TransportError::Unavailable));
}
