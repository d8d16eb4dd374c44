use std::net::SocketAddr;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::info;

use super::error::ApiError;
use super::services;
use super::state::AppState;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Routes that skip API-key auth: the banner and the health probe.
const AUTH_EXEMPT: &[&str] = &["/", "/v1/health"];

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.server.cors_origins);

    let v1 = Router::new()
        .route("/health", get(services::health))
        .route("/jobs", post(services::submit_job).get(services::list_jobs))
        .route("/jobs/batch", post(services::submit_batch))
        .route(
            "/jobs/{job_id}",
            get(services::get_job).delete(services::cancel_job),
        )
        .route("/jobs/{job_id}/result", get(services::get_result))
        .route("/events", get(services::events))
        .route("/metrics", get(services::metrics));

    Router::new()
        .route("/", get(services::root))
        .nest("/v1", v1)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, require_api_key))
        // Outermost stack: request ids are assigned before anything else
        // runs and propagated onto every response.
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(RequestDecompressionLayer::new())
                .layer(cors),
        )
}

pub async fn serve(
    router: Router,
    address: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), AnyError> {
    let listener = TcpListener::bind(address).await?;
    info!(%address, "NimbusChain Fetch API listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// When an API key is configured, every route except the exempt ones
/// requires a matching `X-API-Key` header.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.settings.server.api_key {
        let path = request.uri().path();
        if !AUTH_EXEMPT.contains(&path) {
            let presented = request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok());
            if presented != Some(expected.as_str()) {
                return ApiError::Unauthorized.into_response();
            }
        }
    }
    next.run(request).await
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let list: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(list)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
