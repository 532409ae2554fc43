//! HTTP API server for the lendrail node.
//!
//! REST endpoints for health and status, loan lifecycle requests, partner
//! guardrails, the chain-action queue, circuit-breaker incidents, the
//! dispatch worker and reconciliation. Settlement errors are returned with
//! their stable code and a status derived from the error category.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lendrail_core::{
    ActionId, ActionStatus, ChainAction, FiatProofRecord, GuardrailBounds, GuardrailRecord,
    Incident, IncidentId, Loan, LoanId, LoanParams, PartnerId, Trigger,
};
use lendrail_ledger::Signer;
use lendrail_settlement::{
    ErrorCategory, LoanDetail, ReconcileScope, ReconciliationReport, SettlementError,
    StatusSnapshot,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::state::NodeState;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

// --- Request / response types ---

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct LoanActionResponse {
    pub loan: Loan,
    pub action: ChainAction,
}

#[derive(Serialize)]
pub struct FiatProofResponse {
    pub proof: FiatProofRecord,
    /// `null` while the ledger action waits behind an earlier one.
    pub action: Option<ChainAction>,
}

#[derive(Deserialize)]
pub struct DisbursementRequest {
    pub reference: String,
}

#[derive(Deserialize)]
pub struct RepaymentRequest {
    pub reference: String,
    pub amount: u64,
}

#[derive(Serialize)]
pub struct GuardrailResponse {
    pub partner_id: PartnerId,
    pub active: Option<GuardrailRecord>,
    pub outstanding_principal: u64,
    pub history: Vec<GuardrailRecord>,
}

#[derive(Deserialize)]
pub struct ActionsQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct FireIncidentRequest {
    #[serde(flatten)]
    pub trigger: Trigger,
    #[serde(default = "default_operator")]
    pub operator: String,
}

#[derive(Deserialize)]
pub struct OperatorRequest {
    #[serde(default = "default_operator")]
    pub operator: String,
}

#[derive(Serialize)]
pub struct WorkerResponse {
    pub paused: bool,
    pub signer_address: String,
}

#[derive(Deserialize)]
pub struct RotateSignerRequest {
    /// Hex seed of the new signer; a fresh key is generated when absent.
    #[serde(default)]
    pub secret_key_hex: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ReconcileRequest {
    /// Sample size; a full run when absent.
    #[serde(default)]
    pub sample: Option<usize>,
}

fn default_operator() -> String {
    "operator".into()
}

/// Map a settlement error to its HTTP status and body.
pub fn reject(err: SettlementError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match (&err, err.category()) {
        (SettlementError::Ledger(_), _) => StatusCode::BAD_GATEWAY,
        (_, ErrorCategory::Policy) => StatusCode::UNPROCESSABLE_ENTITY,
        (_, ErrorCategory::Halt) => StatusCode::LOCKED,
        (_, ErrorCategory::Idempotency) | (_, ErrorCategory::Conflict) => StatusCode::CONFLICT,
        (_, ErrorCategory::NotFound) => StatusCode::NOT_FOUND,
        (_, ErrorCategory::Infrastructure) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(code = err.code(), error = %err, "request failed");
    } else {
        tracing::warn!(code = err.code(), error = %err, "request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
}

fn bad_request(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error,
            code: "bad_request".into(),
        }),
    )
}

// --- Handlers ---

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

async fn handle_status(State(state): State<Arc<NodeState>>) -> ApiResult<StatusResponse> {
    let snapshot = state.service.status().map_err(reject)?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        snapshot,
    }))
}

async fn handle_originate(
    State(state): State<Arc<NodeState>>,
    Json(params): Json<LoanParams>,
) -> ApiResult<LoanActionResponse> {
    let (loan, action) = state.service.originate(params).map_err(reject)?;
    Ok(Json(LoanActionResponse { loan, action }))
}

async fn handle_list_loans(State(state): State<Arc<NodeState>>) -> ApiResult<Vec<Loan>> {
    state.service.loans().map(Json).map_err(reject)
}

async fn handle_get_loan(
    State(state): State<Arc<NodeState>>,
    Path(loan_id): Path<LoanId>,
) -> ApiResult<LoanDetail> {
    state.service.loan_detail(&loan_id).map(Json).map_err(reject)
}

async fn handle_disbursement(
    State(state): State<Arc<NodeState>>,
    Path(loan_id): Path<LoanId>,
    Json(req): Json<DisbursementRequest>,
) -> ApiResult<FiatProofResponse> {
    let (proof, action) = state
        .service
        .record_disbursement(loan_id, &req.reference)
        .map_err(reject)?;
    Ok(Json(FiatProofResponse { proof, action }))
}

async fn handle_repayment(
    State(state): State<Arc<NodeState>>,
    Path(loan_id): Path<LoanId>,
    Json(req): Json<RepaymentRequest>,
) -> ApiResult<FiatProofResponse> {
    let (proof, action) = state
        .service
        .record_repayment(loan_id, &req.reference, req.amount)
        .map_err(reject)?;
    Ok(Json(FiatProofResponse { proof, action }))
}

async fn handle_activate(
    State(state): State<Arc<NodeState>>,
    Path(loan_id): Path<LoanId>,
) -> ApiResult<ChainAction> {
    state.service.request_activation(loan_id).map(Json).map_err(reject)
}

async fn handle_default(
    State(state): State<Arc<NodeState>>,
    Path(loan_id): Path<LoanId>,
) -> ApiResult<ChainAction> {
    state.service.request_default(loan_id).map(Json).map_err(reject)
}

async fn handle_close(
    State(state): State<Arc<NodeState>>,
    Path(loan_id): Path<LoanId>,
) -> ApiResult<ChainAction> {
    state.service.request_close(loan_id).map(Json).map_err(reject)
}

async fn handle_set_guardrail(
    State(state): State<Arc<NodeState>>,
    Path(partner_id): Path<String>,
    Json(bounds): Json<GuardrailBounds>,
) -> ApiResult<GuardrailRecord> {
    state
        .service
        .set_guardrail(PartnerId::new(partner_id), bounds)
        .map(Json)
        .map_err(reject)
}

async fn handle_get_guardrail(
    State(state): State<Arc<NodeState>>,
    Path(partner_id): Path<String>,
) -> ApiResult<GuardrailResponse> {
    let partner_id = PartnerId::new(partner_id);
    let service = &state.service;
    Ok(Json(GuardrailResponse {
        active: service.guardrail(&partner_id).map_err(reject)?,
        outstanding_principal: service.outstanding_principal(&partner_id).map_err(reject)?,
        history: service.guardrail_history(&partner_id).map_err(reject)?,
        partner_id,
    }))
}

async fn handle_list_actions(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<ActionsQuery>,
) -> ApiResult<Vec<ChainAction>> {
    let status = match query.status {
        Some(raw) => Some(
            raw.parse::<ActionStatus>()
                .map_err(|e| bad_request(e.to_string()))?,
        ),
        None => None,
    };
    state.service.list_actions(status).map(Json).map_err(reject)
}

async fn handle_redrive_action(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<ActionId>,
) -> ApiResult<ChainAction> {
    state.service.redrive(&id).map(Json).map_err(reject)
}

async fn handle_list_incidents(State(state): State<Arc<NodeState>>) -> ApiResult<Vec<Incident>> {
    state.service.incidents().map(Json).map_err(reject)
}

async fn handle_fire_incident(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<FireIncidentRequest>,
) -> ApiResult<Incident> {
    state
        .service
        .fire(req.trigger, &req.operator)
        .map(Json)
        .map_err(reject)
}

async fn handle_get_incident(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<IncidentId>,
) -> ApiResult<Incident> {
    state.service.incident(&id).map(Json).map_err(reject)
}

async fn handle_ack_incident(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<IncidentId>,
    Json(req): Json<OperatorRequest>,
) -> ApiResult<Incident> {
    state
        .service
        .acknowledge(&id, &req.operator)
        .map(Json)
        .map_err(reject)
}

async fn handle_resolve_incident(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<IncidentId>,
    Json(req): Json<OperatorRequest>,
) -> ApiResult<Incident> {
    state
        .service
        .resolve(&id, &req.operator)
        .await
        .map(Json)
        .map_err(reject)
}

fn worker_response(state: &NodeState) -> Json<WorkerResponse> {
    let worker = state.service.worker();
    Json(WorkerResponse {
        paused: worker.is_paused(),
        signer_address: worker.signer_address(),
    })
}

async fn handle_pause_worker(State(state): State<Arc<NodeState>>) -> Json<WorkerResponse> {
    state.service.pause_worker();
    worker_response(&state)
}

async fn handle_resume_worker(State(state): State<Arc<NodeState>>) -> Json<WorkerResponse> {
    state.service.resume_worker();
    worker_response(&state)
}

async fn handle_rotate_signer(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<RotateSignerRequest>,
) -> ApiResult<WorkerResponse> {
    let signer = match req.secret_key_hex {
        Some(encoded) => Signer::from_hex(&encoded).map_err(|e| bad_request(e.to_string()))?,
        None => Signer::generate(),
    };
    state.service.rotate_signer(signer).await.map_err(reject)?;
    Ok(worker_response(&state))
}

async fn handle_reconcile(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<ReconcileRequest>,
) -> ApiResult<ReconciliationReport> {
    let scope = match req.sample {
        Some(size) => ReconcileScope::Sample(size),
        None => ReconcileScope::Full,
    };
    state.service.reconcile(scope).await.map(Json).map_err(reject)
}

// --- Server ---

pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/status", get(handle_status))
        .route("/api/v1/loans", get(handle_list_loans).post(handle_originate))
        .route("/api/v1/loans/{id}", get(handle_get_loan))
        .route("/api/v1/loans/{id}/disbursement", post(handle_disbursement))
        .route("/api/v1/loans/{id}/repayment", post(handle_repayment))
        .route("/api/v1/loans/{id}/activate", post(handle_activate))
        .route("/api/v1/loans/{id}/default", post(handle_default))
        .route("/api/v1/loans/{id}/close", post(handle_close))
        .route(
            "/api/v1/guardrails/{partner_id}",
            get(handle_get_guardrail).post(handle_set_guardrail),
        )
        .route("/api/v1/actions", get(handle_list_actions))
        .route("/api/v1/actions/{id}/redrive", post(handle_redrive_action))
        .route(
            "/api/v1/incidents",
            get(handle_list_incidents).post(handle_fire_incident),
        )
        .route("/api/v1/incidents/{id}", get(handle_get_incident))
        .route("/api/v1/incidents/{id}/ack", post(handle_ack_incident))
        .route("/api/v1/incidents/{id}/resolve", post(handle_resolve_incident))
        .route("/api/v1/worker/pause", post(handle_pause_worker))
        .route("/api/v1/worker/resume", post(handle_resume_worker))
        .route("/api/v1/worker/rotate-signer", post(handle_rotate_signer))
        .route("/api/v1/reconcile", post(handle_reconcile))
        .with_state(state)
}

pub async fn start_api_server(
    listen_addr: SocketAddr,
    state: Arc<NodeState>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP API server started");
    axum::serve(listener, app).await?;
    Ok(())
}
