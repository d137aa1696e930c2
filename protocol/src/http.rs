use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};

use crate::event::JobEvent;
use crate::peer::PeerRegistry;
use crate::transport::{EventHandler, Transport, TransportError};
use crate::types::*;

/// Peer-to-peer event transport over HTTP.
///
/// Every node runs a small axum endpoint (`POST /events`, `POST /peers`) and
/// pushes events to peers with a reqwest client. One outbound worker per peer
/// drains a FIFO queue, which gives per-pair ordering by source; across peers
/// nothing is ordered.
///
/// Cheap to clone; clones share the same peer registry and queues.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    peers: PeerRegistry,
    handlers: RwLock<Vec<EventHandler>>,
    outbound: Mutex<HashMap<NodeId, mpsc::Sender<JobEvent>>>,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let peers = PeerRegistry::new(config.node_id.clone(), config.peer_timeout_secs);
        Self {
            inner: Arc::new(Inner {
                config,
                peers,
                handlers: RwLock::new(Vec::new()),
                outbound: Mutex::new(HashMap::new()),
                http: reqwest::Client::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    fn self_announcement(&self) -> PeerAnnouncement {
        let config = &self.inner.config;
        PeerAnnouncement {
            node_id: config.node_id.clone(),
            address: config.public_addr.clone(),
            resources: config.resources.clone(),
            labels: config.labels.clone(),
            last_seen: Utc::now(),
        }
    }

    /// Bootstrap: exchange announcements with all seed peers.
    pub async fn bootstrap(&self) -> Result<()> {
        tracing::info!(
            node_id = %self.inner.config.node_id,
            seeds = ?self.inner.config.seed_peers,
            "🌱 Bootstrapping transport"
        );

        for seed_addr in &self.inner.config.seed_peers {
            match self.sync_with_peer(seed_addr).await {
                Ok(count) => {
                    tracing::info!(seed = %seed_addr, new_peers = count, "Synced with seed");
                }
                Err(e) => {
                    tracing::warn!(seed = %seed_addr, error = %e, "Failed to sync with seed");
                }
            }
        }

        tracing::info!(peers = self.inner.peers.count().await, "Bootstrap complete");
        Ok(())
    }

    /// Send our peer list to a peer and merge theirs back.
    async fn sync_with_peer(&self, peer_addr: &str) -> Result<usize> {
        let mut all = self.inner.peers.announcements().await;
        all.push(self.self_announcement());

        let url = format!("http://{peer_addr}/peers");
        let resp = self
            .inner
            .http
            .post(&url)
            .json(&all)
            .send()
            .await
            .context("Failed to reach peer")?;

        if !resp.status().is_success() {
            anyhow::bail!("Peer returned HTTP {}", resp.status());
        }

        let theirs: Vec<PeerAnnouncement> = resp.json().await.context("Failed to parse peer response")?;

        let before = self.inner.peers.count().await;
        self.inner.peers.merge_peers(&theirs).await;
        let after = self.inner.peers.count().await;
        Ok(after.saturating_sub(before))
    }

    /// Periodically announce ourselves and prune dead peers.
    pub async fn run_announce_loop(&self) {
        let interval = std::time::Duration::from_secs(self.inner.config.announce_interval_secs);
        let mut timer = tokio::time::interval(interval);

        loop {
            timer.tick().await;
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }

            self.inner.peers.prune_dead().await;

            let targets = self.inner.peers.random_peers(3).await;
            if targets.is_empty() {
                // Re-try seeds if we lost all peers
                for seed in &self.inner.config.seed_peers {
                    let _ = self.sync_with_peer(seed).await;
                }
                continue;
            }

            for peer in targets {
                if let Err(e) = self.sync_with_peer(&peer.address).await {
                    tracing::debug!(peer = %peer.node_id, error = %e, "Announce failed");
                    self.inner.peers.record_failure(&peer.node_id).await;
                } else {
                    self.inner.peers.touch(&peer.node_id).await;
                }
            }
        }
    }

    /// The inbound HTTP surface, for embedding into the node's server.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/events", post(receive_event))
            .route("/peers", post(exchange_peers))
            .with_state(self.clone())
    }

    /// Bind and serve the inbound endpoint until the process exits.
    pub async fn serve(self) -> Result<()> {
        let addr = self.inner.config.listen_addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding transport on {addr}"))?;
        tracing::info!(addr = %addr, "Transport listening");
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }

    fn deliver(&self, event: JobEvent) {
        let handlers = match self.inner.handlers.read() {
            Ok(h) => h.clone(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Get or spawn the outbound worker for a peer. Each worker drains its
    /// queue in order, which is what gives per-pair FIFO.
    async fn outbound_sender(&self, node_id: &str) -> Option<mpsc::Sender<JobEvent>> {
        let mut outbound = self.inner.outbound.lock().await;
        if let Some(tx) = outbound.get(node_id) {
            if !tx.is_closed() {
                return Some(tx.clone());
            }
        }

        self.inner.peers.get(node_id).await?;

        let (tx, mut rx) = mpsc::channel::<JobEvent>(self.inner.config.outbound_queue_size);
        outbound.insert(node_id.to_string(), tx.clone());

        let transport = self.clone();
        let peer_id = node_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(peer) = transport.inner.peers.get(&peer_id).await else {
                    tracing::debug!(peer = %peer_id, "Peer gone, dropping event");
                    continue;
                };
                let url = format!("http://{}/events", peer.address);
                match transport.inner.http.post(&url).json(&event).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        transport.inner.peers.touch(&peer_id).await;
                    }
                    Ok(resp) => {
                        tracing::warn!(peer = %peer_id, status = %resp.status(), "Peer rejected event");
                        transport.inner.peers.record_failure(&peer_id).await;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer_id, error = %e, "Failed to deliver event");
                        transport.inner.peers.record_failure(&peer_id).await;
                    }
                }
            }
        });

        Some(tx)
    }

    async fn enqueue(&self, node_id: &str, event: JobEvent) {
        let Some(tx) = self.outbound_sender(node_id).await else {
            tracing::warn!(peer = %node_id, event = %event.event_name, "Unknown peer, dropping event");
            return;
        };
        if tx.try_send(event).is_err() {
            tracing::warn!(peer = %node_id, "Outbound queue full, dropping newest event");
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish(&self, event: JobEvent) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }

        if event.is_broadcast() {
            let peers = self.inner.peers.alive_peers().await;
            for peer in peers {
                self.enqueue(&peer.node_id, event.clone()).await;
            }
        } else {
            let target = event.target_node_id.clone();
            self.enqueue(&target, event).await;
        }
        Ok(())
    }

    fn subscribe(&self, handler: EventHandler) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.push(handler);
        }
    }

    async fn connect(&self, addr: &str) -> Result<(), TransportError> {
        self.sync_with_peer(addr)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Connect(addr.to_string()))
    }

    async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.outbound.lock().await.clear();
    }

    fn host_id(&self) -> NodeId {
        self.inner.config.node_id.clone()
    }
}

async fn receive_event(
    State(transport): State<HttpTransport>,
    Json(event): Json<JobEvent>,
) -> Json<serde_json::Value> {
    transport.inner.peers.touch(&event.source_node_id).await;
    tracing::debug!(
        event = %event.event_name,
        job_id = %event.job_id,
        from = %event.source_node_id,
        "Received event"
    );
    transport.deliver(event);
    Json(serde_json::json!({ "status": "ok" }))
}

async fn exchange_peers(
    State(transport): State<HttpTransport>,
    Json(theirs): Json<Vec<PeerAnnouncement>>,
) -> Json<Vec<PeerAnnouncement>> {
    transport.inner.peers.merge_peers(&theirs).await;
    let mut ours = transport.inner.peers.announcements().await;
    ours.push(transport.self_announcement());
    Json(ours)
}
