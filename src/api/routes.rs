//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{
    Router, middleware,
    routing::{get, patch, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::auth::auth_middleware;
use super::handlers::{self, MAX_IMAGE_BYTES, MAX_IMAGES};
use super::sse;
use super::state::AppState;

/// Room for the full image allowance plus multipart overhead.
const MAX_BODY_BYTES: usize = MAX_IMAGES * MAX_IMAGE_BYTES + 1024 * 1024;

fn build_cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .origins()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        // No configured origins means a development posture.
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    }
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    // Tracing layer with request spans and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Everything except token verification and health requires a bearer
    // token.
    let protected = Router::new()
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/api/sessions/{key}",
            patch(handlers::patch_session).delete(handlers::delete_session),
        )
        .route(
            "/api/sessions/{key}/messages",
            get(handlers::list_messages).post(handlers::post_message),
        )
        .route(
            "/api/sessions/{key}/messages/stream",
            post(sse::message_stream),
        )
        .route("/api/events", get(sse::events))
        .layer(middleware::from_fn(auth_middleware));

    Router::new()
        .route("/api/auth/verify", post(handlers::verify_token))
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
