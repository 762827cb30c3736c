//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds only a handle to the relay task and the static asset service. The
//! relay's `GlobalState` is not reachable from here; handlers feed the relay
//! queue and the relay task owns every mutation.

use std::path::Path;

use tower_http::services::ServeDir;

use crate::relay::RelayHandle;

/// Shared application state. Clone is required by Axum; both fields are
/// cheap handles.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub assets: ServeDir,
}

impl AppState {
    #[must_use]
    pub fn new(relay: RelayHandle, assets_dir: &Path) -> Self {
        Self { relay, assets: ServeDir::new(assets_dir).append_index_html_on_directories(true) }
    }
}
