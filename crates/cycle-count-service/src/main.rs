use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{FromRequest, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use clap::Parser;
use cycle_count_api::{
    CycleCountApi, EscalationRequest, LookupSerialRequest, MarkFoundRequest, NdjsonAuditSink,
    ReconcileRequest, ReportMismatchRequest, StartCountRequest, SubmitCountRequest,
    API_CONTRACT_VERSION,
};
use cycle_count_core::{AuditPatch, AuditStatus, CountError, ErrorKind, ExceptionFilter};
use cycle_count_store_sqlite::{InMemorySnapshot, SqliteStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

mod logging;

use logging::{init_tracing, LogFormat};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: CycleCountApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct AuditListQuery {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct IgnoreRequest {
    #[serde(alias = "serialId")]
    serial_id: String,
}

#[derive(Debug, Parser)]
#[command(name = "cycle-count-service")]
#[command(about = "Local HTTP service for cycle count reconciliation")]
struct Args {
    /// `SQLite` database holding bin records, audits and the expected snapshot.
    /// Without it, state lives in process memory.
    #[arg(long, env = "CYCLE_COUNT_DB")]
    db: Option<PathBuf>,
    #[arg(long, env = "CYCLE_COUNT_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// NDJSON expected snapshot. Imported into the database when `--db` is set.
    #[arg(long, env = "CYCLE_COUNT_SNAPSHOT")]
    snapshot: Option<PathBuf>,
    /// Directory receiving one NDJSON mirror file per audit tab.
    #[arg(long, env = "CYCLE_COUNT_AUDIT_DIR")]
    audit_dir: Option<PathBuf>,
    #[arg(long, env = "CYCLE_COUNT_LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long, env = "CYCLE_COUNT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl From<CountError> for ServiceError {
    fn from(err: CountError) -> Self {
        let status = match err.kind() {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let message = match &err {
            CountError::InvalidArgument(message)
            | CountError::NotFound(message)
            | CountError::DependencyUnavailable(message) => message.clone(),
        };
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ErrorBody { kind: err.kind(), message },
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(kind = self.error.kind.as_str(), message = %self.error.message, "request failed");
        }
        (self.status, Json(self)).into_response()
    }
}

/// `Json` body whose rejections use the service error envelope.
struct JsonBody<T>(T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: axum::extract::Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                debug!(status = %rejection.status(), "request body rejected");
                Err(CountError::InvalidArgument(rejection.body_text()).into())
            }
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a blocking API call on the blocking pool and wrap its result.
async fn run_api<T, F>(state: ServiceState, op: F) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&CycleCountApi) -> Result<T, CountError> + Send + 'static,
{
    let data = tokio::task::spawn_blocking(move || op(&state.api))
        .await
        .map_err(|err| CountError::dependency(format!("api worker failed: {err}")))??;
    Ok(Json(envelope(data)))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/counts", get(counts_list))
        .route("/v1/counts/start", post(counts_start))
        .route("/v1/counts/submit", post(counts_submit))
        .route("/v1/counts/reconcile", post(counts_reconcile))
        .route("/v1/counts/mark-found", post(counts_mark_found))
        .route("/v1/counts/escalate", post(counts_escalate))
        .route("/v1/counts/resolve-escalation", post(counts_resolve_escalation))
        .route("/v1/counts/:bin", get(counts_status))
        .route("/v1/audits", get(audits_list))
        .route("/v1/audits/lookup", post(audits_lookup))
        .route("/v1/audits/mismatch", post(audits_mismatch))
        .route("/v1/audits/:id", patch(audits_patch))
        .route("/v1/exceptions", get(exceptions_list))
        .route("/v1/exceptions/ignored", get(exceptions_ignored))
        .route("/v1/exceptions/ignore", post(exceptions_ignore))
        .route("/v1/exceptions/unignore", post(exceptions_unignore))
        .with_state(state)
}

fn build_api(args: &Args) -> Result<CycleCountApi> {
    let api = match &args.db {
        Some(db) => {
            let store = SqliteStore::open_migrated(db)?;
            if let Some(snapshot) = &args.snapshot {
                let summary = store.import_snapshot_ndjson(snapshot)?;
                info!(rows = summary.rows, sha256 = %summary.sha256, "snapshot imported at startup");
            }
            let store = Arc::new(store);
            info!(db = %db.display(), "using sqlite store");
            CycleCountApi::new(store.clone(), store)
        }
        None => {
            let snapshot = match &args.snapshot {
                Some(path) => InMemorySnapshot::load_ndjson(path)?,
                None => InMemorySnapshot::default(),
            };
            info!(snapshot_rows = snapshot.len(), "using in-process store");
            CycleCountApi::in_memory(snapshot)
        }
    };

    Ok(match &args.audit_dir {
        Some(dir) => api.with_audit_sink(Arc::new(NdjsonAuditSink::new(dir.clone()))),
        None => api,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format)?;

    let state = ServiceState { api: build_api(&args)? };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "cycle count service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn counts_list(State(state): State<ServiceState>) -> impl IntoResponse {
    run_api(state, CycleCountApi::list_bins).await
}

async fn counts_start(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<StartCountRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.start_count(&request)).await
}

async fn counts_submit(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<SubmitCountRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.submit_count(request)).await
}

async fn counts_reconcile(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<ReconcileRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.reconcile(&request)).await
}

async fn counts_mark_found(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<MarkFoundRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.mark_found(&request)).await
}

async fn counts_escalate(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<EscalationRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.escalate(&request)).await
}

async fn counts_resolve_escalation(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<EscalationRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.resolve_escalation(&request)).await
}

async fn counts_status(
    State(state): State<ServiceState>,
    Path(bin): Path<String>,
) -> impl IntoResponse {
    run_api(state, move |api| api.get_bin_status(&bin)).await
}

async fn audits_list(
    State(state): State<ServiceState>,
    Query(query): Query<AuditListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let status = match query.status.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(AuditStatus::parse(raw).ok_or_else(|| {
            CountError::InvalidArgument(format!("unknown audit status: {raw}"))
        })?),
        None => None,
    };
    Ok(run_api(state, move |api| api.list_audits(status)).await)
}

async fn audits_lookup(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<LookupSerialRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.lookup_serial(&request)).await
}

async fn audits_mismatch(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<ReportMismatchRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.report_mismatch(&request)).await
}

async fn audits_patch(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    JsonBody(request): JsonBody<AuditPatch>,
) -> impl IntoResponse {
    run_api(state, move |api| api.patch_audit(&id, &request)).await
}

async fn exceptions_list(
    State(state): State<ServiceState>,
    Query(filter): Query<ExceptionFilter>,
) -> impl IntoResponse {
    run_api(state, move |api| api.list_exceptions(&filter)).await
}

async fn exceptions_ignored(State(state): State<ServiceState>) -> impl IntoResponse {
    run_api(state, CycleCountApi::list_ignored).await
}

async fn exceptions_ignore(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<IgnoreRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.ignore_serial(&request.serial_id)).await
}

async fn exceptions_unignore(
    State(state): State<ServiceState>,
    JsonBody(request): JsonBody<IgnoreRequest>,
) -> impl IntoResponse {
    run_api(state, move |api| api.unignore_serial(&request.serial_id)).await
}
