use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use armada_protocol::{HttpTransport, NodeResources, Transport, TransportConfig};
use armada_requester::api::{ApiServerConfig, ApiState};
use armada_requester::cache::{DockerImageCaches, NoopImageResolver};
use armada_requester::retry::FixedBudgetRetry;
use armada_requester::scheduler::{BaseScheduler, RegistryRoster, SchedulerConfig};
use armada_requester::selector::NodeSelector;
use armada_requester::store::InMemoryJobStore;
use armada_requester::verifier::{DeterministicVerifier, TrustedVerifier, Verifier};

#[derive(Parser)]
#[command(name = "armada-requester", about = "Armada requester node")]
struct Cli {
    /// Port for the public API
    #[arg(long, default_value = "8080", env = "ARMADA_PORT")]
    port: u16,

    /// This node's ID on the network (random when unset)
    #[arg(long, env = "ARMADA_NODE_ID")]
    node_id: Option<String>,

    /// Port for the peer event transport
    #[arg(long, default_value = "7700", env = "ARMADA_TRANSPORT_PORT")]
    transport_port: u16,

    /// Public address other nodes can reach the transport at
    #[arg(long, env = "ARMADA_PUBLIC_ADDR")]
    public_addr: Option<String>,

    /// Seed peers for bootstrap (comma-separated host:port)
    #[arg(long, env = "ARMADA_SEED_PEERS", value_delimiter = ',')]
    seed_peers: Vec<String>,

    /// Peer announce interval in seconds
    #[arg(long, default_value = "30")]
    announce_interval: u64,

    /// Stale-job sweep interval in seconds
    #[arg(long, default_value = "30", env = "ARMADA_SWEEP_INTERVAL")]
    sweep_interval: u64,

    /// Default result verifier: trusted or deterministic
    #[arg(long, default_value = "trusted", env = "ARMADA_VERIFIER")]
    verifier: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let node_id = cli.node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(node_id = %node_id, port = cli.port, "Starting Armada requester");

    let public_addr = cli
        .public_addr
        .unwrap_or_else(|| format!("127.0.0.1:{}", cli.transport_port));
    let transport = HttpTransport::new(TransportConfig {
        node_id: node_id.clone(),
        listen_addr: format!("0.0.0.0:{}", cli.transport_port),
        public_addr,
        seed_peers: cli.seed_peers,
        announce_interval_secs: cli.announce_interval,
        resources: NodeResources::default(),
        ..Default::default()
    });

    if let Err(e) = transport.bootstrap().await {
        tracing::warn!("Transport bootstrap error: {e}");
    }
    tokio::spawn(transport.clone().serve());
    let announce = transport.clone();
    tokio::spawn(async move { announce.run_announce_loop().await });

    let store = Arc::new(InMemoryJobStore::new());
    let caches = Arc::new(DockerImageCaches::from_env());
    caches.start_cleanup();

    let verifier: Arc<dyn Verifier> = match cli.verifier.as_str() {
        "deterministic" => Arc::new(DeterministicVerifier),
        _ => Arc::new(TrustedVerifier),
    };

    let roster = Arc::new(RegistryRoster::new(transport.peers().clone()));
    let transport_handle: Arc<dyn Transport> = Arc::new(transport.clone());
    let scheduler = BaseScheduler::new(
        node_id,
        store.clone(),
        transport_handle,
        verifier,
        Arc::new(FixedBudgetRetry::default()),
        roster,
        NodeSelector::default(),
        SchedulerConfig {
            sweep_interval: std::time::Duration::from_secs(cli.sweep_interval),
            ..Default::default()
        },
    );

    scheduler.clone().start_event_worker();
    tokio::spawn(scheduler.clone().run_sweep_loop());

    let state = ApiState {
        scheduler,
        store,
        caches,
        resolver: Arc::new(NoopImageResolver),
        peers: Some(transport.peers().clone()),
        start_time: Utc::now(),
        config: Arc::new(ApiServerConfig::default()),
    };

    let app = armada_requester::api::build_router(state);
    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Requester shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
