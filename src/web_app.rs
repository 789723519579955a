use axum::{
    routing::{get, post},
    Router,
};
use http::header::HeaderName;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, request_id::MakeRequestUuid,
    request_id::PropagateRequestIdLayer, request_id::SetRequestIdLayer, trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::handlers::{handle_health, handle_implied_returns, handle_optimize};

pub fn build_app() -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/health", get(handle_health))
        .route("/optimize", post(handle_optimize))
        .route("/implied-returns", post(handle_implied_returns))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            tower::ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    x_request_id.clone(),
                    MakeRequestUuid,
                ))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(x_request_id))
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
}
