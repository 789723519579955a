use utoipa::OpenApi;

use crate::evolution::implied_returns::{CalibrationConfig, CalibrationRecord, SelectionCriterion};
use crate::evolution::portfolio_evolution::{
    AssetView, EvolutionResult, GeneticConfig, MutationSource,
};
use crate::handlers::{
    ErrorResponse, ImpliedReturnsRequest, ImpliedReturnsResponse, OptimizeRequest, ReturnsPayload,
};
use crate::returns::{DateWindow, ReturnRow};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_optimize,
        crate::handlers::handle_implied_returns,
        crate::handlers::handle_health
    ),
    components(
        schemas(
            OptimizeRequest,
            ImpliedReturnsRequest,
            ImpliedReturnsResponse,
            ReturnsPayload,
            ReturnRow,
            DateWindow,
            AssetView,
            GeneticConfig,
            MutationSource,
            CalibrationConfig,
            CalibrationRecord,
            SelectionCriterion,
            EvolutionResult,
            ErrorResponse
        )
    ),
    tags(
        (name = "Evolution", description = "Portfolio weight optimization"),
        (name = "Health", description = "Liveness")
    )
)]
pub struct ApiDoc;
