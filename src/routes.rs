use axum::{Router, extract::DefaultBodyLimit, routing::any};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::handlers;

/// Routes for everything at or below `mount`. Every method goes to the
/// single dispatching handler.
pub fn file_routes(mount: &str) -> Router<AppState> {
    let router = Router::new();

    if mount.is_empty() {
        return router
            .route("/", any(handlers::serve))
            .route("/{*path}", any(handlers::serve));
    }

    router
        .route(mount, any(handlers::serve))
        .route(&format!("{}/", mount), any(handlers::serve))
        .route(&format!("{}/{{*path}}", mount), any(handlers::serve))
}

/// Complete application: file routes, tracing, and no framework body limit
/// (uploads are bounded by `max_upload_size` instead).
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(file_routes(&state.mount))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
