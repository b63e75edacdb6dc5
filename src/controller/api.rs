use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::SharedState;
use crate::errors::JobError;
use crate::jobs::machine::{Origin, Transition};
use crate::jobs::{BlobField, JobStatus, NewJob, StatusInfo, TransitionChange};

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::JobNotFound { .. } => ApiError::NotFound(err.to_string()),
            JobError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            JobError::Invalid { message, .. } => ApiError::BadRequest(message),
            JobError::Dispatch(e) => ApiError::BadGateway(format!(
                "{}; the job was moved to {}",
                e,
                JobStatus::QueuedError
            )),
            JobError::Database(e) => {
                error!(error = %e, "Database error");
                ApiError::Internal("Database error".into())
            }
        }
    }
}

// ── Request / response types ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
    pub filename: String,
    /// base64 of the tar.gz archive.
    pub archive: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Only jobs this user owns or collaborates on.
    pub user: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransitionRequest {
    pub by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub text: String,
    pub by: String,
}

/// Who is asking for a job's files. Identity itself is vouched for upstream.
#[derive(Debug, Default, Deserialize)]
pub struct ViewerQuery {
    #[serde(default)]
    pub reviewer: bool,
    pub user: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusEntry {
    pub status: JobStatus,
    #[serde(flatten)]
    pub info: StatusInfo,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/statuses", get(list_statuses))
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/transitions/{name}", post(apply_transition))
        .route("/api/jobs/{id}/comments", get(list_comments).post(add_comment))
        .route("/api/jobs/{id}/history", get(job_history))
        .route("/api/jobs/{id}/archive", get(job_archive))
        .route("/api/jobs/{id}/output", get(job_output))
        .route("/api/jobs/{id}/errors", get(job_errors))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_statuses() -> Json<Vec<StatusEntry>> {
    Json(
        JobStatus::ALL
            .iter()
            .map(|status| StatusEntry {
                status: *status,
                info: status.info(),
            })
            .collect(),
    )
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut jobs = state.engine.list(query.include_deleted).await?;
    if let Some(user) = &query.user {
        jobs.retain(|job| job.is_visible_to(user));
    }
    Ok(Json(jobs))
}

async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let archive = BASE64
        .decode(req.archive.as_bytes())
        .map_err(|_| ApiError::BadRequest("archive must be base64".into()))?;
    let job = state
        .engine
        .submit(NewJob {
            name: req.name,
            description: req.description,
            owner: req.owner,
            collaborators: req.collaborators,
            filename: req.filename,
            archive,
        })
        .await?;
    let detail = state.engine.detail(job.id).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.detail(id).await?))
}

async fn apply_transition(
    State(state): State<SharedState>,
    Path((id, name)): Path<(i64, String)>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let transition: Transition = name.parse().map_err(ApiError::BadRequest)?;
    if transition.spec().origin != Origin::Reviewer {
        return Err(ApiError::Forbidden(format!(
            "{} is not a reviewer transition",
            transition
        )));
    }
    state
        .engine
        .apply_transition(
            id,
            transition,
            TransitionChange {
                actor: req.by,
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(state.engine.detail(id).await?))
}

async fn list_comments(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.comments(id).await?))
}

async fn add_comment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }
    let comment = state.engine.comment(id, req.text, req.by).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn job_history(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.history(id).await?))
}

async fn job_archive(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(viewer): Query<ViewerQuery>,
) -> Result<Response, ApiError> {
    let job = state.engine.get(id).await?;
    let allowed = viewer.reviewer
        || viewer
            .user
            .as_deref()
            .is_some_and(|user| job.is_visible_to(user));
    if !allowed {
        return Err(ApiError::Forbidden("Not allowed to download this archive".into()));
    }
    let bytes = state
        .engine
        .read_blob(id, BlobField::Archive)
        .await?
        .unwrap_or_default();
    Ok(attachment("application/gzip", &job.filename, bytes))
}

async fn job_output(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(viewer): Query<ViewerQuery>,
) -> Result<Response, ApiError> {
    run_stream(&state, id, BlobField::Output, &viewer).await
}

async fn job_errors(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(viewer): Query<ViewerQuery>,
) -> Result<Response, ApiError> {
    run_stream(&state, id, BlobField::Errors, &viewer).await
}

/// Reviewers may read run streams at any time; everyone else once released.
async fn run_stream(
    state: &SharedState,
    id: i64,
    field: BlobField,
    viewer: &ViewerQuery,
) -> Result<Response, ApiError> {
    let job = state.engine.get(id).await?;
    if !job.can_view_run_output(viewer.reviewer) {
        return Err(ApiError::Forbidden(format!(
            "The job's {} is available once it is released",
            field.column()
        )));
    }
    let bytes = state
        .engine
        .read_blob(id, field)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} has no {}", id, field.column())))?;
    let filename = format!("job-{}-{}", id, field.column());
    Ok(attachment("application/octet-stream", &filename, bytes))
}

fn attachment(content_type: &str, filename: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename.replace('"', "")),
            ),
        ],
        bytes,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::*;
    use crate::controller::test_support::get;
    use crate::dispatch::fakes::RecordingDispatcher;
    use crate::jobs::{Job, RunOutput};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn released(state: &SharedState, job: &Job) {
        let engine = &state.engine;
        engine.approve_code(job.id, None).await.unwrap();
        engine.run_job(job.id).await.unwrap();
        engine
            .complete_job_run(
                job.id,
                RunOutput {
                    output: Some(b"Hello from Docker!".to_vec()),
                    errors: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_check() {
        let (state, _) = test_state().await;
        let response = app(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"ok");
    }

    #[tokio::test]
    async fn test_statuses_carry_codes() {
        let (state, _) = test_state().await;
        let response = app(state).oneshot(get("/api/statuses")).await.unwrap();
        let statuses: Vec<serde_json::Value> = body_json(response).await;
        assert_eq!(statuses.len(), 10);
        let released = statuses
            .iter()
            .find(|s| s["status"] == "RELEASED")
            .unwrap();
        assert_eq!(released["code"], 50);
        assert_eq!(released["is_success"], true);
    }

    #[tokio::test]
    async fn test_submit_job() {
        let state = state_with(Arc::new(RecordingDispatcher::default()));
        let body = serde_json::json!({
            "name": "Hello Job",
            "owner": "toejam",
            "filename": "hello.tar.gz",
            "archive": BASE64.encode(b"\x1f\x8bdata"),
        });
        let response = app(state.clone())
            .oneshot(post_json("/api/jobs", &body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let detail: serde_json::Value = body_json(response).await;
        assert_eq!(detail["job"]["status"], "PENDING_CODE_REVIEW");
        assert_eq!(detail["status_info"]["code"], 10);
    }

    #[tokio::test]
    async fn test_submit_rejects_long_name_and_bad_archive() {
        let (state, _) = test_state().await;
        let long = serde_json::json!({
            "name": "x".repeat(65),
            "owner": "toejam",
            "filename": "a.tar.gz",
            "archive": BASE64.encode(b"x"),
        });
        let response = app(state.clone())
            .oneshot(post_json("/api/jobs", &long.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bad = serde_json::json!({
            "name": "ok",
            "owner": "toejam",
            "filename": "a.tar.gz",
            "archive": "%%%",
        });
        let response = app(state)
            .oneshot(post_json("/api/jobs", &bad.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_hides_deleted_and_filters_by_user() {
        let (state, first) = test_state().await;
        let second = state.engine.submit(sample_job()).await.unwrap();
        let mut other = sample_job();
        other.owner = "lewanda".into();
        other.collaborators.clear();
        let third = state.engine.submit(other).await.unwrap();
        state.engine.delete_job(second.id, None).await.unwrap();

        let response = app(state.clone()).oneshot(get("/api/jobs")).await.unwrap();
        let jobs: Vec<Job> = body_json(response).await;
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![third.id, first.id]);

        let response = app(state.clone())
            .oneshot(get("/api/jobs?user=earl"))
            .await
            .unwrap();
        let jobs: Vec<Job> = body_json(response).await;
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first.id]);

        let response = app(state)
            .oneshot(get("/api/jobs?include_deleted=true"))
            .await
            .unwrap();
        let jobs: Vec<Job> = body_json(response).await;
        assert_eq!(jobs.len(), 3);
    }

    #[tokio::test]
    async fn test_get_missing_job_is_not_found() {
        let (state, _) = test_state().await;
        let response = app(state).oneshot(get("/api/jobs/999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_approve_code_dispatches() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = state_with(dispatcher.clone());
        let job = state.engine.submit(sample_job()).await.unwrap();

        let uri = format!("/api/jobs/{}/transitions/approve_code", job.id);
        let response = app(state)
            .oneshot(post_json(&uri, r#"{"by": "reviewer"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: serde_json::Value = body_json(response).await;
        assert_eq!(detail["job"]["status"], "QUEUED");
        assert_eq!(dispatcher.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_bad_gateway_and_queued_error() {
        let state = state_with(Arc::new(RecordingDispatcher::failing()));
        let job = state.engine.submit(sample_job()).await.unwrap();

        let uri = format!("/api/jobs/{}/transitions/approve_code", job.id);
        let response = app(state.clone())
            .oneshot(post_json(&uri, "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            state.engine.get(job.id).await.unwrap().status,
            JobStatus::QueuedError
        );
    }

    #[tokio::test]
    async fn test_callback_transitions_are_forbidden_to_reviewers() {
        let (state, job) = test_state().await;
        state.engine.approve_code(job.id, None).await.unwrap();

        for name in ["run_job", "queue_failed", "complete_job_run"] {
            let uri = format!("/api/jobs/{}/transitions/{}", job.id, name);
            let response = app(state.clone())
                .oneshot(post_json(&uri, "{}"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", name);
        }
        assert_eq!(state.engine.get(job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_unknown_transition_is_bad_request() {
        let (state, job) = test_state().await;
        let uri = format!("/api/jobs/{}/transitions/launch", job.id);
        let response = app(state).oneshot(post_json(&uri, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wrong_source_transition_is_conflict() {
        let (state, job) = test_state().await;
        let uri = format!("/api/jobs/{}/transitions/approve_output", job.id);
        let response = app(state).oneshot(post_json(&uri, "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("PENDING_CODE_REVIEW"));
    }

    #[tokio::test]
    async fn test_comments_and_action_required() {
        let (state, job) = test_state().await;
        let uri = format!("/api/jobs/{}/comments", job.id);
        let response = app(state.clone())
            .oneshot(post_json(&uri, r#"{"text": "Please pin versions", "by": "reviewer"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app(state.clone()).oneshot(get(&uri)).await.unwrap();
        let comments: Vec<serde_json::Value> = body_json(response).await;
        assert_eq!(comments.len(), 1);

        let response = app(state)
            .oneshot(get(&format!("/api/jobs/{}", job.id)))
            .await
            .unwrap();
        let detail: serde_json::Value = body_json(response).await;
        assert_eq!(detail["action_required"]["text"], "Please pin versions");
    }

    #[tokio::test]
    async fn test_empty_comment_is_bad_request() {
        let (state, job) = test_state().await;
        let uri = format!("/api/jobs/{}/comments", job.id);
        let response = app(state)
            .oneshot(post_json(&uri, r#"{"text": "  ", "by": "reviewer"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_lists_transitions() {
        let (state, job) = test_state().await;
        released(&state, &job).await;
        let response = app(state)
            .oneshot(get(&format!("/api/jobs/{}/history", job.id)))
            .await
            .unwrap();
        let history: Vec<serde_json::Value> = body_json(response).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[2]["message"], "The job has successfully finished running.");
        assert_eq!(history[0]["kind"], "state_change");
    }

    #[tokio::test]
    async fn test_output_access_rule() {
        let (state, job) = test_state().await;
        released(&state, &job).await;
        let uri = format!("/api/jobs/{}/output", job.id);

        let response = app(state.clone()).oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(state.clone())
            .oneshot(get(&format!("{}?reviewer=true", uri)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"Hello from Docker!");

        state.engine.approve_output(job.id, None).await.unwrap();
        let response = app(state.clone()).oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(state)
            .oneshot(get(&format!("/api/jobs/{}/errors", job.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_archive_download_for_owner_and_reviewer() {
        let (state, job) = test_state().await;
        let base = format!("/api/jobs/{}/archive", job.id);

        let response = app(state.clone())
            .oneshot(get(&format!("{}?user=lewanda", base)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(state.clone())
            .oneshot(get(&format!("{}?user=toejam", base)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("hello.tar.gz"));
        assert_eq!(body_bytes(response).await, b"tarball");

        let response = app(state)
            .oneshot(get(&format!("{}?reviewer=true", base)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_job_error_mapping() {
        let conflict: ApiError = JobError::InvalidTransition {
            id: 1,
            transition: Transition::RunJob,
            from: JobStatus::Running,
            expected: JobStatus::Queued,
        }
        .into();
        assert!(matches!(conflict, ApiError::Conflict(_)));

        let missing: ApiError = JobError::JobNotFound { id: 1 }.into();
        assert!(matches!(missing, ApiError::NotFound(_)));
    }
}
