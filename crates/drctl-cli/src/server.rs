//! HTTP surface: one JSON endpoint per pipeline stage.
//!
//! Every response is an [`Envelope`]. Batch stages answer 200 with a
//! [`BatchReport`](drctl_core::protocol::BatchReport) even when items
//! failed; only request-level errors (bad input, unknown environment, a
//! failed single-item stage) map to a 4xx/5xx status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use drctl_core::DrError;
use drctl_core::config::DrConfig;
use drctl_core::model::{
    CheckedVolume, ClusterDatastore, ClusterVm, DatastoreInventory, NicAssignment,
    PresentedDatastore, PresentedVolume, ProtectionGroup, RegisteredVm, RestoredVolume, VmHost,
};
use drctl_core::protocol::{BatchReport, Envelope};
use drctl_runtime::flasharray::ArraySnapshot;
use drctl_runtime::reply::RescanRecord;
use drctl_runtime::state::{RemovedVm, Store};
use drctl_runtime::workflow::{Connector, NicCommit, NicPush, Orchestrator, PowerChange};

/// Header selecting the environment profile for a request.
pub const ENVIRONMENT_HEADER: &str = "x-drctl-environment";
const REQUEST_ID_HEADER: &str = "x-request-id";
const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DrConfig>,
    pub store: Store,
    pub connector: Arc<dyn Connector>,
}

// ============================================================================
// Errors
// ============================================================================

/// Request-level failure, rendered as a failure envelope.
#[derive(Debug)]
pub struct ApiError(DrError);

impl From<DrError> for ApiError {
    fn from(e: DrError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(DrError::invalid(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(DrError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(kind = self.0.kind(), error = %self.0, "Request failed");
        }
        (status, Json(Envelope::<()>::failure(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope::data(data)))
}

fn done(message: impl Into<String>) -> ApiResult<()> {
    Ok(Json(Envelope::message(message)))
}

/// Unwrap a JSON body, turning a rejection into an invalid-input envelope.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    Ok(payload?.0)
}

// ============================================================================
// Per-request orchestrator
// ============================================================================

/// Orchestrator bound to the environment named by [`ENVIRONMENT_HEADER`].
pub struct Stage(pub Orchestrator);

impl FromRequestParts<AppState> for Stage {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let tag = match parts.headers.get(ENVIRONMENT_HEADER) {
            Some(value) => Some(value.to_str().map_err(|_| {
                DrError::invalid(format!("{} header is not valid text", ENVIRONMENT_HEADER))
            })?),
            None => None,
        };
        let orch = Orchestrator::connect(
            &state.config,
            state.store.clone(),
            state.connector.as_ref(),
            tag,
        )?;
        Ok(Self(orch))
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/restore", post(restore))
        .route("/api/restored-volumes/reload", post(reload_restored))
        .route("/api/restored-volumes/{name}", delete(delete_restored))
        .route(
            "/api/presented-volumes",
            post(present).delete(reinitialize_presented),
        )
        .route("/api/rescan", post(rescan))
        .route("/api/hosts/refresh", post(refresh_hosts))
        .route("/api/cluster/datastores", get(cluster_datastores))
        .route("/api/cluster/vms", get(cluster_vms))
        .route("/api/luns/check", post(check_luns))
        .route("/api/datastores", delete(reinitialize_datastores))
        .route("/api/datastores/resignature", post(resignature))
        .route("/api/datastores/inventory", post(inventory))
        .route("/api/vms/register", post(register))
        .route("/api/vms/nics", post(commit_nics))
        .route("/api/vms/nics/apply", post(apply_nics))
        .route("/api/vms/power-on", post(power_on))
        .route("/api/vms/power-off", post(power_off))
        .route("/api/vms/remove", post(remove_vms))
        .route(
            "/api/protection-groups",
            post(add_protection_group).get(list_protection_groups),
        )
        .route(
            "/api/protection-groups/snapshots",
            get(protection_snapshots),
        )
        .route("/api/protection-groups/{id}", delete(delete_protection_group))
        .layer(middleware::from_fn(trace_request))
        .with_state(state)
}

/// Tag each request with an id and log its outcome.
async fn trace_request(req: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let span = info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;
    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request complete"
        )
    });
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Serve until Ctrl-C.
pub async fn serve(state: AppState, listen: std::net::SocketAddr) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(%listen, "drctl listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("server error")
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

async fn health(State(state): State<AppState>) -> Response {
    let healthy = matches!(
        tokio::time::timeout(PING_TIMEOUT, state.store.ping()).await,
        Ok(Ok(()))
    );
    let (code, status) = if healthy {
        (StatusCode::OK, "pass")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "fail")
    };
    (code, Json(Envelope::data(Health { status }))).into_response()
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    snapshot: String,
    volume: String,
}

async fn restore(
    Stage(orch): Stage,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> ApiResult<RestoredVolume> {
    let req = body(payload)?;
    ok(orch.restore_snapshot(&req.snapshot, &req.volume).await?)
}

async fn reload_restored(Stage(orch): Stage) -> ApiResult<BatchReport<RestoredVolume>> {
    ok(orch.reload_restored_volumes().await?)
}

async fn delete_restored(Stage(orch): Stage, Path(name): Path<String>) -> ApiResult<()> {
    orch.delete_restored_volume(&name).await?;
    done(format!("restored volume {} removed", name))
}

/// Either explicit volumes or every restored volume.
#[derive(Debug, Default, Deserialize)]
struct PresentRequest {
    #[serde(default)]
    volumes: Vec<PresentedVolume>,
    #[serde(default)]
    from_restored: bool,
}

async fn present(
    Stage(orch): Stage,
    payload: Result<Json<PresentRequest>, JsonRejection>,
) -> ApiResult<BatchReport<PresentedVolume>> {
    let req = body(payload)?;
    match (req.from_restored, req.volumes.is_empty()) {
        (true, true) => ok(orch.present_restored().await?),
        (false, false) => ok(orch.present_volumes(req.volumes).await?),
        (true, false) => {
            Err(DrError::invalid("give either volumes or from_restored, not both").into())
        }
        (false, true) => Err(DrError::invalid("no volumes to present").into()),
    }
}

async fn reinitialize_presented(Stage(orch): Stage) -> ApiResult<()> {
    let cleared = orch.reinitialize_presented().await?;
    done(format!("{} presented volumes cleared", cleared))
}

async fn reinitialize_datastores(Stage(orch): Stage) -> ApiResult<()> {
    let cleared = orch.reinitialize_datastores().await?;
    done(format!("{} datastores cleared", cleared))
}

async fn rescan(Stage(orch): Stage) -> ApiResult<Vec<RescanRecord>> {
    ok(orch.rescan_storage().await?)
}

async fn refresh_hosts(Stage(orch): Stage) -> ApiResult<Vec<VmHost>> {
    ok(orch.refresh_hosts().await?)
}

/// `?force_refresh=true` bypasses the stored inventory.
#[derive(Debug, Default, Deserialize)]
struct InventoryQuery {
    #[serde(default)]
    force_refresh: bool,
}

async fn cluster_datastores(
    Stage(orch): Stage,
    query: Result<Query<InventoryQuery>, QueryRejection>,
) -> ApiResult<Vec<ClusterDatastore>> {
    let Query(query) = query?;
    ok(orch.refresh_datastores(query.force_refresh).await?)
}

async fn cluster_vms(
    Stage(orch): Stage,
    query: Result<Query<InventoryQuery>, QueryRejection>,
) -> ApiResult<Vec<ClusterVm>> {
    let Query(query) = query?;
    ok(orch.refresh_vms(query.force_refresh).await?)
}

async fn check_luns(Stage(orch): Stage) -> ApiResult<BatchReport<CheckedVolume>> {
    ok(orch.check_luns().await?)
}

async fn resignature(Stage(orch): Stage) -> ApiResult<BatchReport<PresentedDatastore>> {
    ok(orch.resignature_datastores().await?)
}

async fn inventory(Stage(orch): Stage) -> ApiResult<BatchReport<DatastoreInventory>> {
    ok(orch.inventory_datastores().await?)
}

/// Explicit paths, or every unregistered inventoried file when empty.
#[derive(Debug, Default, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    vmx_paths: Vec<String>,
}

async fn register(
    Stage(orch): Stage,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<BatchReport<RegisteredVm>> {
    let req = body(payload)?;
    if req.vmx_paths.is_empty() {
        return ok(orch.register_all().await?);
    }
    ok(orch.register_vms(req.vmx_paths).await?)
}

#[derive(Debug, Deserialize)]
struct NicsRequest {
    assignments: Vec<NicAssignment>,
}

async fn commit_nics(
    Stage(orch): Stage,
    payload: Result<Json<NicsRequest>, JsonRejection>,
) -> ApiResult<BatchReport<NicCommit>> {
    let req = body(payload)?;
    ok(orch.commit_nics(req.assignments).await?)
}

async fn apply_nics(Stage(orch): Stage) -> ApiResult<BatchReport<NicPush>> {
    ok(orch.reconfigure_nics().await?)
}

#[derive(Debug, Deserialize)]
struct VmNamesRequest {
    vm_names: Vec<String>,
}

async fn power_on(
    Stage(orch): Stage,
    payload: Result<Json<VmNamesRequest>, JsonRejection>,
) -> ApiResult<BatchReport<PowerChange>> {
    ok(orch.power_on(body(payload)?.vm_names).await?)
}

async fn power_off(
    Stage(orch): Stage,
    payload: Result<Json<VmNamesRequest>, JsonRejection>,
) -> ApiResult<BatchReport<PowerChange>> {
    ok(orch.power_off(body(payload)?.vm_names).await?)
}

async fn remove_vms(
    Stage(orch): Stage,
    payload: Result<Json<VmNamesRequest>, JsonRejection>,
) -> ApiResult<BatchReport<RemovedVm>> {
    ok(orch.remove_vms(body(payload)?.vm_names).await?)
}

#[derive(Debug, Deserialize)]
struct ProtectionGroupRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct ProtectionGroupAdded {
    #[serde(flatten)]
    group: ProtectionGroup,
    created: bool,
}

async fn add_protection_group(
    Stage(orch): Stage,
    payload: Result<Json<ProtectionGroupRequest>, JsonRejection>,
) -> ApiResult<ProtectionGroupAdded> {
    let req = body(payload)?;
    let (group, created) = orch.add_protection_group(&req.name).await?;
    ok(ProtectionGroupAdded { group, created })
}

async fn list_protection_groups(Stage(orch): Stage) -> ApiResult<Vec<ProtectionGroup>> {
    ok(orch.list_protection_groups().await?)
}

async fn delete_protection_group(Stage(orch): Stage, Path(id): Path<i64>) -> ApiResult<()> {
    orch.delete_protection_group(id).await?;
    done(format!("protection group {} removed", id))
}

async fn protection_snapshots(Stage(orch): Stage) -> ApiResult<BatchReport<Vec<ArraySnapshot>>> {
    ok(orch.protection_snapshots().await?)
}
