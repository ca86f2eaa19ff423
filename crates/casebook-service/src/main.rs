use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use casebook_api::{
    AddClientRequest, AddVisitRequest, ApiError, CaseworkApi, ClientRecord, ProgressReport,
    StartMigrationResult, VisitRecord, API_CONTRACT_VERSION,
};
use casebook_core::{
    ChunkReport, ClientId, PipelineError, SchedulerError, VisitId, WorkItem, WorkScheduler,
    DEFAULT_CHUNK_SIZE,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const ACTOR_HEADER: &str = "x-actor";
const MAX_DELIVERY_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct ServiceState {
    api: CaseworkApi,
    queue: UnboundedSender<WorkItem>,
    chunk_size: usize,
}

/// Work Scheduler backed by the service's in-process delivery queue.
/// Submitting never blocks; the delivery loop picks items up in order.
#[derive(Debug, Clone)]
struct QueueScheduler {
    queue: UnboundedSender<WorkItem>,
}

impl WorkScheduler for QueueScheduler {
    fn submit(&mut self, item: WorkItem) -> Result<(), SchedulerError> {
        self.queue.send(item).map_err(|err| SchedulerError(err.to_string()))
    }
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
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct AddUserRequest {
    email: String,
    admin: bool,
}

#[derive(Debug, Clone, Serialize)]
struct AddUserResult {
    email: String,
    admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ResumeForm {
    cursor: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SeedLegacyRequest {
    visit: AddVisitRequest,
    count: usize,
}

#[derive(Debug, Clone, Serialize)]
struct SeedLegacyResult {
    seeded: Vec<VisitId>,
}

#[derive(Debug, Parser)]
#[command(name = "casebook-service")]
#[command(about = "Local HTTP service for conference casework")]
struct Args {
    #[arg(long, default_value = "./casebook.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let status = match &err {
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Pipeline(
                PipelineError::MalformedCursor(_) | PipelineError::InvalidChunkSize,
            ) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
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

fn actor_from(headers: &HeaderMap) -> Result<&str, ServiceError> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|actor| !actor.trim().is_empty())
        .ok_or_else(|| {
            ServiceError::new(StatusCode::FORBIDDEN, format!("missing {ACTOR_HEADER} header"))
        })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/users", post(users_add))
        .route("/v1/clients", post(clients_add).get(clients_list))
        .route("/v1/clients/:client_id", get(client_show).put(client_edit))
        .route("/v1/clients/:client_id/visits", get(visits_list))
        .route("/v1/visits", post(visits_add))
        .route("/v1/migration/start", post(migration_start))
        .route("/v1/migration/resume", post(migration_resume))
        .route("/v1/migration/progress", get(migration_progress))
        .route("/v1/migration/seed-legacy", post(migration_seed_legacy))
        .with_state(state)
}

/// Delivery loop for the in-process work queue. Each item is attempted a
/// bounded number of times with linear backoff; a permanent failure drops
/// the item instead of retrying.
async fn delivery_worker(
    api: CaseworkApi,
    queue: UnboundedSender<WorkItem>,
    mut receiver: UnboundedReceiver<WorkItem>,
    chunk_size: usize,
) {
    while let Some(item) = receiver.recv().await {
        deliver(&api, &queue, item, chunk_size).await;
    }
}

async fn deliver(
    api: &CaseworkApi,
    queue: &UnboundedSender<WorkItem>,
    item: WorkItem,
    chunk_size: usize,
) {
    let token = item.resume_cursor.encode();
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        let mut scheduler = QueueScheduler { queue: queue.clone() };
        match api.resume_migration(&token, &mut scheduler, chunk_size) {
            Ok(ChunkReport::Continued { cursor_after, processed }) => {
                tracing::info!(cursor = %token, %cursor_after, processed, "chunk processed");
                return;
            }
            Ok(ChunkReport::Complete) => {
                tracing::info!(cursor = %token, "backfill chain complete");
                return;
            }
            Err(err) if err.is_permanent() => {
                tracing::error!(cursor = %token, error = %err, "dropping undeliverable work item");
                return;
            }
            Err(err) => {
                tracing::warn!(cursor = %token, attempt, error = %err, "chunk delivery failed");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }
    }
    tracing::error!(cursor = %token, "chunk delivery exhausted its retry budget");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let api = CaseworkApi::new(args.db);
    let (queue, receiver) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(delivery_worker(api.clone(), queue.clone(), receiver, args.chunk_size));

    let state = ServiceState { api, queue, chunk_size: args.chunk_size };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn users_add(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AddUserRequest>,
) -> Result<Json<ServiceEnvelope<AddUserResult>>, ServiceError> {
    let actor = actor_from(&headers)?;
    state.api.add_user(actor, &request.email, request.admin)?;
    Ok(Json(envelope(AddUserResult { email: request.email, admin: request.admin })))
}

async fn clients_add(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AddClientRequest>,
) -> Result<Json<ServiceEnvelope<ClientRecord>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let record = state.api.add_client(actor, request)?;
    Ok(Json(envelope(record)))
}

async fn clients_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<ClientRecord>>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let clients = state.api.list_clients(actor)?;
    Ok(Json(envelope(clients)))
}

async fn client_edit(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(client_id): Path<i64>,
    Json(request): Json<AddClientRequest>,
) -> Result<Json<ServiceEnvelope<ClientRecord>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let record = state
        .api
        .edit_client(actor, ClientId(client_id), request)?
        .ok_or_else(|| ServiceError::new(StatusCode::NOT_FOUND, "no such client"))?;
    Ok(Json(envelope(record)))
}

async fn client_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(client_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<ClientRecord>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let record = state
        .api
        .get_client(actor, ClientId(client_id))?
        .ok_or_else(|| ServiceError::new(StatusCode::NOT_FOUND, "no such client"))?;
    Ok(Json(envelope(record)))
}

async fn visits_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(client_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Vec<VisitRecord>>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let visits = state.api.list_visits(actor, ClientId(client_id))?;
    Ok(Json(envelope(visits)))
}

async fn visits_add(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AddVisitRequest>,
) -> Result<Json<ServiceEnvelope<VisitRecord>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let record = state.api.add_visit(actor, request)?;
    Ok(Json(envelope(record)))
}

async fn migration_start(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<StartMigrationResult>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let mut scheduler = QueueScheduler { queue: state.queue.clone() };
    let result = state.api.start_migration(actor, &mut scheduler, state.chunk_size)?;
    tracing::info!(actor = %result.actor, scheduled = result.scheduled, "backfill start requested");
    Ok(Json(envelope(result)))
}

/// Scheduler-facing delivery endpoint. A malformed cursor is permanent and
/// answers 400; store or scheduler failures answer 500 so the caller
/// redelivers the same item.
async fn migration_resume(
    State(state): State<ServiceState>,
    Form(form): Form<ResumeForm>,
) -> Result<Json<ServiceEnvelope<ChunkReport>>, ServiceError> {
    let mut scheduler = QueueScheduler { queue: state.queue.clone() };
    let report = state.api.resume_migration(&form.cursor, &mut scheduler, state.chunk_size)?;
    Ok(Json(envelope(report)))
}

async fn migration_progress(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ProgressReport>>, ServiceError> {
    let report = state.api.progress_report()?;
    Ok(Json(envelope(report)))
}

async fn migration_seed_legacy(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<SeedLegacyRequest>,
) -> Result<Json<ServiceEnvelope<SeedLegacyResult>>, ServiceError> {
    let actor = actor_from(&headers)?;
    let seeded = state.api.seed_legacy_visits(actor, request.visit, request.count)?;
    Ok(Json(envelope(SeedLegacyResult { seeded })))
}
