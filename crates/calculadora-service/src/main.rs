use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use calculadora_core::{
    format_rfc3339, parse_rfc3339, BatchItem, BatchOutcome, CalcError, HistoryQuery,
    HistoryRecord, Operation, SortField, SortOrder,
};
use calculadora_store_sqlite::HistoryApi;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, Clone)]
struct ServiceState {
    api: HistoryApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    body: serde_json::Value,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    malformed_input_total: AtomicU64,
    negative_operand_total: AtomicU64,
    division_by_zero_total: AtomicU64,
    structural_error_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    malformed_input_total: u64,
    negative_operand_total: u64,
    division_by_zero_total: u64,
    structural_error_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "malformed_input" => {
                self.malformed_input_total.fetch_add(1, Ordering::Relaxed);
            }
            "negative_operand" => {
                self.negative_operand_total.fetch_add(1, Ordering::Relaxed);
            }
            "division_by_zero" => {
                self.division_by_zero_total.fetch_add(1, Ordering::Relaxed);
            }
            "structural_error" => {
                self.structural_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_unavailable" => {
                self.store_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            malformed_input_total: self.malformed_input_total.load(Ordering::Relaxed),
            negative_operand_total: self.negative_operand_total.load(Ordering::Relaxed),
            division_by_zero_total: self.division_by_zero_total.load(Ordering::Relaxed),
            structural_error_total: self.structural_error_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn error_code(err: &CalcError) -> &'static str {
    match err {
        CalcError::NegativeOperand { .. } => "negative_operand",
        CalcError::DivisionByZero { .. } => "division_by_zero",
        CalcError::EmptyBatch
        | CalcError::InvalidOperationKind(_)
        | CalcError::InsufficientOperands => "structural_error",
        CalcError::StoreUnavailable(_) => "store_unavailable",
    }
}

fn validation_failure(
    status: StatusCode,
    err: &CalcError,
    operation: Operation,
    operands: &[f64],
) -> ServiceFailure {
    ServiceFailure {
        status,
        body: json!({
            "error": err.to_string(),
            "operacion": operation.as_str(),
            "operandos": operands,
        }),
    }
}

fn failure_for(err: &CalcError) -> ServiceFailure {
    match err {
        CalcError::NegativeOperand {
            operation,
            operands,
        } => validation_failure(StatusCode::BAD_REQUEST, err, *operation, operands),
        CalcError::DivisionByZero {
            operation,
            operands,
        } => validation_failure(StatusCode::FORBIDDEN, err, *operation, operands),
        CalcError::EmptyBatch
        | CalcError::InvalidOperationKind(_)
        | CalcError::InsufficientOperands => ServiceFailure {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": err.to_string() }),
        },
        CalcError::StoreUnavailable(_) => ServiceFailure {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: json!({ "error": err.to_string() }),
        },
    }
}

impl ServiceState {
    fn malformed_input(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("malformed_input", false);
        ServiceFailure {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": rejection.body_text() }),
        }
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(HistoryApi) -> Result<T, CalcError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                ServiceFailure {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: json!({
                        "error": format!(
                            "{operation_label} timed out after {} ms",
                            self.operation_timeout.as_millis()
                        ),
                    }),
                }
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            ServiceFailure {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: json!({ "error": format!("{operation_label} join failure: {err}") }),
            }
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                if let CalcError::StoreUnavailable(detail) = &err {
                    tracing::warn!(operation = operation_label, %detail, "history store unavailable");
                }
                self.telemetry.record_failure(error_code(&err), false);
                Err(failure_for(&err))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct BinaryOperationRequest {
    a: f64,
    b: f64,
}

#[derive(Debug, Clone, Serialize)]
struct OperationResponse {
    a: f64,
    b: f64,
    resultado: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchItemRequest {
    op: String,
    #[serde(default)]
    nums: Vec<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HistorialParams {
    op: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    sort_by: Option<String>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HistorialEntry {
    a: f64,
    b: f64,
    resultado: f64,
    date: String,
    operacion: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct HistorialResponse {
    historial: Vec<HistorialEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Parser)]
#[command(name = "calculadora")]
#[command(about = "HTTP calculator service with a persisted operation history")]
struct Args {
    #[arg(long, default_value = "./calculadora.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

fn app(state: ServiceState) -> Router {
    // Allow all origins; the service fronts a browser client.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/calculadora/sum", post(sum))
        .route("/calculadora/sub", post(sub))
        .route("/calculadora/mul", post(mul))
        .route("/calculadora/div", post(div))
        .route("/calculadora/historial", get(historial))
        .route("/calculadora/batch", post(batch))
        .route("/calculadora/health", get(health))
        .layer(cors)
        .with_state(state)
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
    let state = ServiceState {
        api: HistoryApi::new(args.db.clone()),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    tracing::info!(bind = %args.bind, db = %args.db.display(), "calculadora service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn binary_operation(
    state: ServiceState,
    operation: Operation,
    payload: Result<Json<BinaryOperationRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.malformed_input(&rejection))?;
    let resultado = state
        .run_blocking(operation.as_str(), move |api| {
            api.record_operation(operation, request.a, request.b)
        })
        .await?;
    Ok(Json(OperationResponse {
        a: request.a,
        b: request.b,
        resultado,
    }))
}

async fn sum(
    State(state): State<ServiceState>,
    payload: Result<Json<BinaryOperationRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, ServiceFailure> {
    binary_operation(state, Operation::Sum, payload).await
}

async fn sub(
    State(state): State<ServiceState>,
    payload: Result<Json<BinaryOperationRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, ServiceFailure> {
    binary_operation(state, Operation::Sub, payload).await
}

async fn mul(
    State(state): State<ServiceState>,
    payload: Result<Json<BinaryOperationRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, ServiceFailure> {
    binary_operation(state, Operation::Mul, payload).await
}

async fn div(
    State(state): State<ServiceState>,
    payload: Result<Json<BinaryOperationRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, ServiceFailure> {
    binary_operation(state, Operation::Div, payload).await
}

fn build_history_query(params: &HistorialParams) -> HistoryQuery {
    // Unknown op kinds and unparseable dates are silently ignored; unknown
    // sort options fall back to date/desc.
    HistoryQuery {
        operation: params.op.as_deref().and_then(Operation::parse),
        date_from: params.date_from.as_deref().and_then(parse_rfc3339),
        date_to: params.date_to.as_deref().and_then(parse_rfc3339),
        sort_field: params
            .sort_by
            .as_deref()
            .and_then(SortField::parse)
            .unwrap_or_default(),
        sort_order: params
            .order
            .as_deref()
            .and_then(SortOrder::parse)
            .unwrap_or_default(),
    }
}

fn shape_entry(record: &HistoryRecord) -> Result<HistorialEntry, ServiceFailure> {
    let date = format_rfc3339(record.date).map_err(|err| ServiceFailure {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: json!({ "error": format!("failed to format record date: {err}") }),
    })?;
    Ok(HistorialEntry {
        a: record.operands.first().copied().unwrap_or(0.0),
        b: record.operands.get(1).copied().unwrap_or(0.0),
        resultado: record.resultado,
        date,
        operacion: record.operation.as_str(),
    })
}

async fn historial(
    State(state): State<ServiceState>,
    Query(params): Query<HistorialParams>,
) -> Result<Json<HistorialResponse>, ServiceFailure> {
    let query = build_history_query(&params);
    let records = state
        .run_blocking("historial", move |api| api.query_history(&query))
        .await?;

    let mut historial = Vec::with_capacity(records.len());
    for record in &records {
        historial.push(shape_entry(record)?);
    }
    Ok(Json(HistorialResponse { historial }))
}

async fn batch(
    State(state): State<ServiceState>,
    payload: Result<Json<Vec<BatchItemRequest>>, JsonRejection>,
) -> Result<Json<Vec<BatchOutcome>>, ServiceFailure> {
    let Json(items) = payload.map_err(|rejection| state.malformed_input(&rejection))?;
    let items: Vec<BatchItem> = items
        .into_iter()
        .map(|item| BatchItem {
            op: item.op,
            nums: item.nums,
        })
        .collect();
    let outcomes = state
        .run_blocking("batch", move |api| api.run_batch(&items))
        .await?;
    Ok(Json(outcomes))
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let api = state.api.clone();
    let ping = tokio::task::spawn_blocking(move || api.ping()).await;
    let status = match ping {
        Ok(Ok(())) => "ok",
        Ok(Err(err)) => {
            tracing::warn!(%err, "health ping failed");
            "degraded"
        }
        Err(err) => {
            tracing::warn!(%err, "health ping join failure");
            "degraded"
        }
    };
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status,
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}
