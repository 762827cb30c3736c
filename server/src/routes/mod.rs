//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! A single port carries both surfaces. `/` is the websocket endpoint for
//! sync sessions (and the index document for plain requests), `/healthz`
//! answers liveness probes, and every other path falls through to the static
//! asset directory. `ServeDir` rejects `..` components, so requests can never
//! resolve outside the asset root; unknown extensions are served as
//! `application/octet-stream`.

pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let assets = state.assets.clone();

    Router::new()
        .route("/", get(ws::handle_root))
        .route("/healthz", get(healthz))
        .fallback_service(assets)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
