use axum::{extract::Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::evolution::implied_returns::{
    CalibrationConfig, CalibrationError, CalibrationRecord, ImpliedReturnsCalibrator,
    SelectionCriterion,
};
use crate::evolution::portfolio_evolution::{
    AssetView, EvolutionError, EvolutionResult, GeneticConfig, GeneticPortfolio,
};
use crate::returns::{DateWindow, ReturnMatrix, ReturnRow};

/// Wire form of a return matrix; rows may come in any date order.
#[derive(Deserialize, Debug, Clone, ToSchema)]
pub struct ReturnsPayload {
    pub assets: Vec<String>,
    pub rows: Vec<ReturnRow>,
}

#[derive(Deserialize, Debug, Clone, ToSchema)]
pub struct OptimizeRequest {
    pub views: Vec<AssetView>,
    pub returns: ReturnsPayload,
    pub window: DateWindow,
    #[serde(default)]
    pub config: GeneticConfig,
}

#[derive(Deserialize, Debug, Clone, ToSchema)]
pub struct ImpliedReturnsRequest {
    pub views: Vec<AssetView>,
    /// Asset whose view is held with the most confidence.
    pub anchor: String,
    pub returns: ReturnsPayload,
    pub window: DateWindow,
    pub config: CalibrationConfig,
    pub criterion: SelectionCriterion,
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ImpliedReturnsResponse {
    pub assets: Vec<String>,
    pub samples: usize,
    pub selected: CalibrationRecord,
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn evolution_status(error: &EvolutionError) -> StatusCode {
    match error {
        EvolutionError::Seeding(_) | EvolutionError::Generation { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EvolutionError::WorkerPool(_) | EvolutionError::Cancelled { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

fn calibration_status(error: &CalibrationError) -> StatusCode {
    match error {
        CalibrationError::Numeric { .. } | CalibrationError::FlatAnchor { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Each request builds its own worker pool, so the requested size never exceeds the host.
fn bounded_config(mut config: GeneticConfig) -> GeneticConfig {
    let available = num_cpus::get();
    if config.max_concurrency > available {
        warn!(
            "Requested max_concurrency {} capped at {}",
            config.max_concurrency, available
        );
        config.max_concurrency = available;
    }
    config
}

fn run_optimization(payload: OptimizeRequest) -> Result<EvolutionResult, EvolutionError> {
    let returns = ReturnMatrix::new(payload.returns.assets, payload.returns.rows)
        .map_err(EvolutionError::Construction)?;
    let config = bounded_config(payload.config);
    let mut optimizer = GeneticPortfolio::new(&payload.views, &returns, &payload.window, config)?;
    optimizer.fit()?;
    optimizer.into_result()
}

fn run_calibration(
    payload: ImpliedReturnsRequest,
) -> Result<ImpliedReturnsResponse, CalibrationError> {
    let returns = ReturnMatrix::new(payload.returns.assets, payload.returns.rows)
        .map_err(CalibrationError::Construction)?;
    let mut calibrator = ImpliedReturnsCalibrator::new(
        &payload.views,
        &payload.anchor,
        &returns,
        &payload.window,
        payload.config,
    )?;
    let samples = calibrator.calibrate()?.len();
    let selected = calibrator.select(payload.criterion)?.clone();
    Ok(ImpliedReturnsResponse {
        assets: calibrator.assets().to_vec(),
        samples,
        selected,
    })
}

/// Runs the evolutionary optimizer to convergence on the supplied data.
#[utoipa::path(
    post,
    path = "/optimize",
    request_body = OptimizeRequest,
    responses(
        (status = 200, description = "Best allocation and fitness trace", body = EvolutionResult),
        (status = 400, description = "Invalid configuration or inputs", body = ErrorResponse),
        (status = 422, description = "Numeric failure during the run", body = ErrorResponse),
        (status = 500, description = "Worker pool failure or cancelled run", body = ErrorResponse)
    ),
    tag = "Evolution"
)]
pub async fn handle_optimize(
    Json(payload): Json<OptimizeRequest>,
) -> Result<Json<EvolutionResult>, ApiError> {
    // the search is CPU bound, keep it off the async workers
    let outcome = tokio::task::spawn_blocking(move || run_optimization(payload))
        .await
        .map_err(|join_error| {
            error!("Optimization task failed to complete: {}", join_error);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, join_error)
        })?;

    outcome
        .map(Json)
        .map_err(|evolution_error| api_error(evolution_status(&evolution_error), evolution_error))
}

/// Samples random portfolios and returns the one whose implied returns best fit the views.
#[utoipa::path(
    post,
    path = "/implied-returns",
    request_body = ImpliedReturnsRequest,
    responses(
        (status = 200, description = "Selected calibration sample", body = ImpliedReturnsResponse),
        (status = 400, description = "Invalid configuration or inputs", body = ErrorResponse),
        (status = 422, description = "Numeric failure during calibration", body = ErrorResponse)
    ),
    tag = "Evolution"
)]
pub async fn handle_implied_returns(
    Json(payload): Json<ImpliedReturnsRequest>,
) -> Result<Json<ImpliedReturnsResponse>, ApiError> {
    let outcome = tokio::task::spawn_blocking(move || run_calibration(payload))
        .await
        .map_err(|join_error| {
            error!("Calibration task failed to complete: {}", join_error);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, join_error)
        })?;

    outcome.map(Json).map_err(|calibration_error| {
        api_error(calibration_status(&calibration_error), calibration_error)
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = String)),
    tag = "Health"
)]
pub async fn handle_health() -> &'static str {
    "ok"
}
