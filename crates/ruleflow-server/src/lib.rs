pub mod client;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use ruleflow_core::config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Rules
        .route("/api/rules", post(routes::rules::upsert_rules))
        .route("/api/rules/execute", post(routes::rules::execute))
        .route("/api/rules/convert", post(routes::rules::convert))
        .route("/api/rules/import", post(routes::rules::import))
        .route(
            "/api/rules/validate-expression",
            post(routes::rules::validate_expression),
        )
        .route("/api/rules/{rule_set}", get(routes::rules::list_rules))
        // Manual review
        .route(
            "/api/rules/{rule_set}/manual-review",
            get(routes::review::list_pending),
        )
        .route(
            "/api/rules/{rule_set}/manual-review/{name}/complete",
            post(routes::review::complete),
        )
        .route(
            "/api/rules/{rule_set}/manual-review/{name}/reject",
            post(routes::review::reject),
        )
        // Guard
        .route("/api/guard", get(routes::guard::get_guard))
        .route("/api/guard/sweep", post(routes::guard::sweep))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// State for a real deployment: rules under `root`, writes through the
/// tracker configured in `config`.
pub fn production_state(root: PathBuf, config: Config) -> anyhow::Result<state::AppState> {
    let client = client::HttpWorkItemClient::new(&config.tracker)?;
    if config.tracker.token().is_none() {
        tracing::warn!(
            "tracker token variable {} is not set; requests will be unauthenticated",
            config.tracker.token_env
        );
    }
    Ok(state::AppState::new(root, config, Arc::new(client))?)
}

/// Start the webhook server on the configured address.
pub async fn serve(root: PathBuf, config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(production_state(root, config)?, listener).await
}

/// Serve `app_state` on a pre-bound listener. The guard sweeper runs for as
/// long as the server does.
pub async fn serve_on(
    app_state: state::AppState,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual = listener.local_addr()?;
    let sweeper = ruleflow_core::guard::spawn_sweeper(app_state.guard.clone());
    let app = build_router(app_state);

    tracing::info!("ruleflow listening on http://{actual}");

    let result = axum::serve(listener, app).await;
    sweeper.abort();
    result?;
    Ok(())
}
