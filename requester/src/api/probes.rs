use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use sysinfo::Disks;

use super::ApiState;
use crate::store::ListRequest;

/// Disk statistics for the filesystem the node runs on.
pub async fn healthz() -> Json<Value> {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.list().first());

    let (all, free) = match root {
        Some(disk) => (disk.total_space(), disk.available_space()),
        None => (0, 0),
    };

    Json(json!({
        "DiskFreeSpace": {
            "ROOT": {
                "All": all,
                "Used": all.saturating_sub(free),
                "Free": free,
            }
        }
    }))
}

pub async fn livez() -> &'static str {
    "OK"
}

pub async fn readyz() -> &'static str {
    "READY"
}

/// Runtime statistics.
pub async fn varz(State(state): State<ApiState>) -> Json<Value> {
    let jobs = state
        .store
        .list_jobs(ListRequest::default())
        .await
        .unwrap_or_default();
    let active = jobs.iter().filter(|s| !s.state.state.is_terminal()).count();
    let peer_count = match &state.peers {
        Some(peers) => peers.count().await,
        None => 0,
    };

    Json(json!({
        "node_id": state.scheduler.host_id(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (Utc::now() - state.start_time).num_seconds(),
        "jobs": { "total": jobs.len(), "active": active },
        "peers": peer_count,
    }))
}
