//! HTTP route handlers for the control API.

use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orion::clock::ClockPair;
use orion::control::ControlStatus;
use orion::core::lease::{Lease, LeaseGrant};
use orion::core::types::{Command, CommandRequest, Decision, ExecutorKind, OPERATOR};
use orion::hub::InstanceSnapshot;
use orion::queue::SubmitOutcome;

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/instances", post(register_instance))
        .route(
            "/instances/{id}",
            get(get_instance).delete(deregister_instance),
        )
        .route("/instances/{id}/pause", post(pause_instance))
        .route("/instances/{id}/resume", post(resume_instance))
        .route("/instances/{id}/executor/start", post(start_executor))
        .route("/instances/{id}/executor/stop", post(stop_executor))
        .route("/commands", get(list_commands).post(submit_command))
        .route("/commands/{id}", get(get_command))
        .route("/commands/{id}/approve", post(approve_command))
        .route("/commands/{id}/reject", post(reject_command))
        .route("/leases/{id}/acquire", post(acquire_lease))
        .route("/leases/{id}/release", post(release_lease))
        .route("/leases/{id}/heartbeat", post(heartbeat_lease))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - hub, queue depth, and decisions awaiting an operator.
async fn get_status(State(state): State<AppState>) -> Json<ControlStatus> {
    Json(state.control.get_status())
}

#[derive(Deserialize)]
struct RegisterBody {
    instance_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// POST /api/instances
async fn register_instance(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<(StatusCode, Json<InstanceSnapshot>)> {
    state
        .control
        .register_instance(&body.instance_id, body.display_name.as_deref())?;
    let snapshot = state
        .control
        .get_instance(&body.instance_id)
        .ok_or_else(|| ApiError::not_found(format!("unknown instance {}", body.instance_id)))?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceSnapshot>> {
    state
        .control
        .get_instance(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown instance {id}")))
}

/// DELETE /api/instances/:id - stops the instance loop first.
async fn deregister_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.control.deregister_instance(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct SubmitResponse {
    request_id: String,
    deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: Option<Decision>,
}

impl From<SubmitOutcome> for SubmitResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Accepted {
                request_id,
                decision,
            } => Self {
                request_id,
                deduplicated: false,
                decision: Some(decision),
            },
            SubmitOutcome::Deduplicated {
                original_request_id,
            } => Self {
                request_id: original_request_id,
                deduplicated: true,
                decision: None,
            },
        }
    }
}

fn accepted(outcome: SubmitOutcome) -> (StatusCode, Json<SubmitResponse>) {
    (StatusCode::ACCEPTED, Json(outcome.into()))
}

fn operator() -> String {
    OPERATOR.to_string()
}

#[derive(Deserialize)]
struct PauseBody {
    reason: String,
    #[serde(default = "operator")]
    requested_by: String,
}

async fn pause_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PauseBody>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let outcome = state.control.pause(&id, &body.reason, &body.requested_by)?;
    Ok(accepted(outcome))
}

#[derive(Deserialize)]
struct ActorBody {
    #[serde(default = "operator")]
    requested_by: String,
}

async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActorBody>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let outcome = state.control.resume(&id, &body.requested_by)?;
    Ok(accepted(outcome))
}

#[derive(Deserialize)]
struct ExecutorBody {
    #[serde(default = "hub_loop")]
    kind: ExecutorKind,
}

fn hub_loop() -> ExecutorKind {
    ExecutorKind::HubLoop
}

/// POST /api/instances/:id/executor/start - 409 while another executor is live.
async fn start_executor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecutorBody>,
) -> ApiResult<StatusCode> {
    state.control.start_executor(&id, body.kind)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct StoppedResponse {
    released: bool,
}

async fn stop_executor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StoppedResponse>> {
    let released = state.control.stop_executor(&id)?;
    Ok(Json(StoppedResponse { released }))
}

async fn submit_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let outcome = state.control.submit_command(request)?;
    Ok(accepted(outcome))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /api/commands?limit=N - most recent commands, newest last.
async fn list_commands(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Command>> {
    Json(state.control.recent_commands(query.limit))
}

async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Command>> {
    state
        .control
        .get_command(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown command {id}")))
}

#[derive(Deserialize)]
struct ApproveBody {
    #[serde(default = "operator")]
    actor: String,
}

async fn approve_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> ApiResult<Json<Command>> {
    Ok(Json(state.control.approve_command(&id, &body.actor)?))
}

#[derive(Deserialize)]
struct RejectBody {
    #[serde(default = "operator")]
    actor: String,
    reason: String,
}

async fn reject_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> ApiResult<Json<Command>> {
    Ok(Json(
        state
            .control
            .reject_command(&id, &body.actor, &body.reason)?,
    ))
}

/// Wire form of a lease. Monotonic deadlines are reported as wall-clock times.
#[derive(Serialize)]
struct LeaseView {
    instance_id: String,
    holder_id: String,
    reason: String,
    ttl_secs: u64,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expired_lock_reclaimed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_holder: Option<String>,
}

impl LeaseView {
    fn from_lease(lease: Lease) -> Self {
        let clock = ClockPair::now();
        Self {
            acquired_at: clock.to_wall(lease.acquired_at),
            expires_at: clock.to_wall(lease.expires_at),
            ttl_secs: lease.ttl.as_secs(),
            instance_id: lease.instance_id,
            holder_id: lease.holder_id,
            reason: lease.reason,
            expired_lock_reclaimed: None,
            previous_holder: None,
        }
    }

    fn from_grant(grant: LeaseGrant) -> Self {
        Self {
            expired_lock_reclaimed: Some(grant.expired_lock_reclaimed),
            previous_holder: grant.previous_holder,
            ..Self::from_lease(grant.lease)
        }
    }
}

#[derive(Deserialize)]
struct AcquireBody {
    holder_id: String,
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    reason: String,
}

async fn acquire_lease(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AcquireBody>,
) -> ApiResult<Json<LeaseView>> {
    let ttl = body.ttl_secs.map(Duration::from_secs);
    let grant = state
        .control
        .acquire_lease(&id, &body.holder_id, ttl, &body.reason)?;
    Ok(Json(LeaseView::from_grant(grant)))
}

#[derive(Deserialize)]
struct ReleaseBody {
    holder_id: String,
    #[serde(default)]
    force_if_expired: bool,
    #[serde(default = "operator")]
    actor_id: String,
    #[serde(default)]
    reason: String,
}

#[derive(Serialize)]
struct ReleaseResponse {
    released: bool,
}

/// POST /api/leases/:id/release - a live lease held by someone else is never evicted.
async fn release_lease(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReleaseBody>,
) -> ApiResult<Json<ReleaseResponse>> {
    let released = state.control.release_lease(
        &id,
        &body.holder_id,
        body.force_if_expired,
        &body.actor_id,
        &body.reason,
    )?;
    Ok(Json(ReleaseResponse { released }))
}

#[derive(Deserialize)]
struct HeartbeatBody {
    holder_id: String,
}

async fn heartbeat_lease(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> ApiResult<Json<LeaseView>> {
    let lease = state.control.heartbeat_lease(&id, &body.holder_id)?;
    Ok(Json(LeaseView::from_lease(lease)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use orion::control::Runtime;
    use orion::io::sink::BroadcastSink;
    use orion::io::store::MemoryStore;
    use orion::test_support::{ScriptedAdapters, test_config};

    use super::*;

    fn app() -> (Runtime, Router) {
        let mut config = test_config();
        config.instances[0].executor = None;
        let runtime = Runtime::build(
            &config,
            Arc::new(MemoryStore::new()),
            ScriptedAdapters::healthy().adapters(),
        )
        .expect("build runtime");
        runtime.start().expect("start runtime");
        let state = AppState::new(runtime.control().clone(), BroadcastSink::new(8));
        let router = Router::new().nest("/api", api_router()).with_state(state);
        (runtime, router)
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test(start_paused = true)]
    async fn status_lists_configured_instances() {
        let (runtime, router) = app();
        let (status, body) = call(&router, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hub"]["instances"][0]["instance_id"], "orion");
        assert_eq!(body["queue_depth"], 0);
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_command_is_queryable_and_deduplicated() {
        let (runtime, router) = app();
        let request = json!({
            "target_instance": "orion",
            "action": {"kind": "nudge", "reason": "operator"},
            "risk_level": "low"
        });
        let (status, first) = call(&router, Method::POST, "/api/commands", Some(request.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["deduplicated"], false);
        assert_eq!(first["decision"], "auto_approved");

        let (status, second) = call(&router, Method::POST, "/api/commands", Some(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(second["deduplicated"], true);
        assert_eq!(second["request_id"], first["request_id"]);

        let id = first["request_id"].as_str().expect("request id");
        let (status, command) = call(&router, Method::GET, &format!("/api/commands/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(command["target_instance"], "orion");
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_targets_are_not_found() {
        let (runtime, router) = app();
        let (status, body) = call(
            &router,
            Method::POST,
            "/api/instances/ghost/pause",
            Some(json!({"reason": "maintenance"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "unknown_instance");

        let (status, _) = call(&router, Method::GET, "/api/commands/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_routes_enforce_exclusion() {
        let (runtime, router) = app();
        let (status, lease) = call(
            &router,
            Method::POST,
            "/api/leases/orion/acquire",
            Some(json!({"holder_id": "script", "ttl_secs": 60, "reason": "migration"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(lease["holder_id"], "script");
        assert_eq!(lease["ttl_secs"], 60);
        assert_eq!(lease["expired_lock_reclaimed"], false);

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/leases/orion/acquire",
            Some(json!({"holder_id": "other"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "lease_conflict");

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/leases/orion/release",
            Some(json!({"holder_id": "other", "force_if_expired": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["released"], false);

        let (status, _) = call(
            &router,
            Method::POST,
            "/api/leases/orion/heartbeat",
            Some(json!({"holder_id": "script"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn register_then_deregister_instance() {
        let (runtime, router) = app();
        let (status, body) = call(
            &router,
            Method::POST,
            "/api/instances",
            Some(json!({"instance_id": "beta", "display_name": "Beta"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["display_name"], "Beta");
        assert_eq!(body["running"], false);

        let (status, _) = call(&router, Method::DELETE, "/api/instances/beta", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&router, Method::GET, "/api/instances/beta", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_executor_is_a_conflict() {
        let (runtime, router) = app();
        call(
            &router,
            Method::POST,
            "/api/instances",
            Some(json!({"instance_id": "beta"})),
        )
        .await;
        let (status, _) = call(
            &router,
            Method::POST,
            "/api/instances/orion/executor/start",
            Some(json!({"kind": "policy_loop"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/instances/beta/executor/start",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "executor_conflict");
        runtime.shutdown().await;
    }
}
