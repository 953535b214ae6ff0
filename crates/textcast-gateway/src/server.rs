//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use textcast_core::config::GatewayConfig;
use textcast_scheduler::{MessageDb, RetryPolicy};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::ApiKeyDb;
use crate::routes;

/// Shared state for the gateway server.
pub struct AppState {
    pub db: Arc<MessageDb>,
    pub keys: Arc<ApiKeyDb>,
    /// Used to flag which failed rows are still retry-eligible.
    pub retry_policy: RetryPolicy,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(db: Arc<MessageDb>, keys: Arc<ApiKeyDb>, retry_policy: RetryPolicy) -> Self {
        Self {
            db,
            keys,
            retry_policy,
            start_time: std::time::Instant::now(),
        }
    }
}

/// The authenticated caller, inserted by [`require_api_key`].
#[derive(Debug, Clone)]
pub struct Caller {
    pub owner_id: String,
    pub key_id: String,
}

fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"success": false, "error": msg})),
    )
        .into_response()
}

/// Bearer API key middleware. Resolves the key to its owner.
async fn require_api_key(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return unauthorized("missing bearer API key");
    };

    match state.keys.validate(token, Utc::now()) {
        Ok(record) => {
            req.extensions_mut().insert(Caller {
                owner_id: record.owner_id,
                key_id: record.id,
            });
            next.run(req).await
        }
        Err(textcast_core::TextcastError::Unauthorized(msg)) => unauthorized(&msg),
        Err(e) => {
            tracing::error!("API key lookup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(shared: Arc<AppState>, cors_origins: &[String]) -> Router {
    // Protected routes: require a valid API key
    let protected = Router::new()
        .route("/messages", post(routes::create_message))
        .route("/messages/pending", get(routes::pending_messages))
        .route("/messages/sent", post(routes::report_sent))
        .route("/messages/failed", post(routes::report_failed).get(routes::failed_messages))
        .route("/messages/stats", get(routes::message_stats))
        .route("/messages/{id}", delete(routes::delete_message))
        .route("/messages/{id}/cancel", post(routes::cancel_message))
        .route("/messages/{id}/reschedule", post(routes::reschedule_message))
        .route("/study-messages/pending", get(routes::study_pending))
        .route("/study-messages/delivered", post(routes::study_delivered))
        .route("/study-messages/failed", post(routes::study_failed))
        .route("/study-messages/stats", get(routes::study_stats))
        .route("/study-messages/{id}/cancel", post(routes::cancel_study))
        .route("/study-messages/{id}/reschedule", post(routes::reschedule_study))
        .route("/verify", get(routes::verify))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_api_key,
        ));

    // Public routes: no auth
    let public = Router::new().route("/health", get(routes::health_check));

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));
    let cors = if cors_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
            .collect();
        cors.allow_origin(origins)
    };

    protected
        .merge(public)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: &GatewayConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state, &config.cors_origins);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
