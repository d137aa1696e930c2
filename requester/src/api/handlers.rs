use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path as FsPath;

use super::{ApiError, ApiState};
use crate::error::RequesterError;
use crate::model::*;
use crate::sharding::{explode_local_dir, ExecutionPlan};
use crate::store::{JobSnapshot, ListRequest, SortKey};
use armada_protocol::JobEvent;

#[derive(Debug, Deserialize)]
pub struct JobManifest {
    pub spec: JobSpec,
    #[serde(default)]
    pub deal: Deal,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub job: JobManifest,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job: Job,
}

pub async fn submit(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let mut spec = request.job.spec;

    // Pin docker images to a digest when the resolver knows one
    if let EngineSpec::Docker { image, .. } = &mut spec.engine {
        if !image.contains('@') {
            if let Some(digest) = state.caches.resolve_tag(image, state.resolver.as_ref()).await {
                *image = format!("{image}@{digest}");
            }
        }
    }

    let plan = build_execution_plan(&spec)?;
    let job = Job::admit(spec, request.job.deal, plan)?;
    let job = state.scheduler.submit(job).await?;
    Ok(Json(SubmitResponse { job }))
}

fn build_execution_plan(spec: &JobSpec) -> Result<ExecutionPlan, RequesterError> {
    let Some(sharding) = &spec.sharding else {
        return Ok(ExecutionPlan::default());
    };
    let mut paths = Vec::new();
    for input in &spec.inputs {
        match input.source {
            StorageSource::LocalDirectory => {
                let root = input.url.as_deref().ok_or_else(|| {
                    RequesterError::InvalidJob("local directory input needs a url".into())
                })?;
                let exploded = explode_local_dir(FsPath::new(root), &input.path)
                    .map_err(|e| RequesterError::InvalidJob(format!("cannot explode input: {e}")))?;
                paths.extend(exploded);
            }
            _ => paths.push(input.path.clone()),
        }
    }
    ExecutionPlan::build(&paths, sharding)
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_reverse: Option<bool>,
    #[serde(default)]
    pub include_terminated: Option<bool>,
}

pub async fn list(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobSnapshot>>, ApiError> {
    let sort_by = match params.sort_by.as_deref() {
        Some("id") => SortKey::Id,
        _ => SortKey::CreatedAt,
    };
    let request = ListRequest {
        selector: params.selector,
        limit: params.limit.unwrap_or(10),
        sort_by,
        ascending: !params.sort_reverse.unwrap_or(false),
        include_terminated: params.include_terminated.unwrap_or(true),
    };
    Ok(Json(state.store.list_jobs(request).await?))
}

pub async fn states(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobState>, ApiError> {
    Ok(Json(state.store.get_job_state(&id).await?))
}

#[derive(Debug, Serialize)]
pub struct PublishedResult {
    pub node_id: String,
    pub shard_index: u32,
    pub result: StorageRef,
}

pub async fn results(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<PublishedResult>>, ApiError> {
    let job_state = state.store.get_job_state(&id).await?;
    let published = job_state
        .executions
        .iter()
        .filter(|e| e.state == ExecutionStateType::Completed)
        .filter_map(|e| {
            e.published_result.clone().map(|result| PublishedResult {
                node_id: e.node_id.clone(),
                shard_index: e.shard_index,
                result,
            })
        })
        .collect();
    Ok(Json(published))
}

pub async fn events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<JobEvent>>, ApiError> {
    // 404 for jobs we have never seen, empty history is fine otherwise
    state.store.get_job(&id).await?;
    Ok(Json(state.store.events(&id).await))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub job_id: String,
    #[serde(default)]
    pub reason: String,
}

pub async fn cancel(
    State(state): State<ApiState>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Value>, ApiError> {
    let reason = if request.reason.is_empty() {
        "cancelled by user".to_string()
    } else {
        request.reason
    };
    state.scheduler.cancel(&request.job_id, &reason).await?;
    Ok(Json(json!({ "job_id": request.job_id, "state": "Cancelled" })))
}
