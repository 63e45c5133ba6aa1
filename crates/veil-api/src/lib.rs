pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/reload", post(handlers::handle_reload))
        .route("/status", get(handlers::handle_status))
        .route("/peers", get(handlers::handle_peers))
        .with_state(state);

    Router::new()
        .route("/ping", get(handlers::handle_ping))
        .nest("/v1", api_routes)
        .layer(cors)
}

/// Serve the control API on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "control API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
