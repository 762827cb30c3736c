//! Settings relay: one shared clock configuration for every display instance.
//!
//! ARCHITECTURE
//! ============
//! - `store`: in-memory `GlobalState` (active widget + per-widget parameters)
//! - `relay`: single-task session registry and mutation/broadcast logic
//! - `routes`: Axum router (websocket sessions, static assets, health)
//! - `config`: environment-driven listener configuration

pub mod config;
pub mod relay;
pub mod routes;
pub mod state;
pub mod store;

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;

use tokio::net::TcpListener;
use tracing::info;

pub use config::{ConfigError, ServerConfig};
pub use relay::{Relay, RelayHandle, spawn_relay};
pub use state::AppState;
pub use store::StateStore;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Bind the configured address and serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the listener cannot be bound and
/// [`ServerError::Serve`] if the accept loop fails.
pub async fn run(config: ServerConfig, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), ServerError> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    serve(listener, &config.assets_dir, StateStore::new(), shutdown).await
}

/// Serve the relay on an already-bound listener, starting from `store`.
///
/// # Errors
///
/// Returns [`ServerError::Serve`] if the accept loop fails.
pub async fn serve(
    listener: TcpListener,
    assets_dir: &Path,
    store: StateStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let (relay, _relay_task) = spawn_relay(Relay::new(store));
    let app = routes::app(AppState::new(relay, assets_dir));

    let addr = listener.local_addr().map_err(ServerError::Serve)?;
    info!(%addr, assets = %assets_dir.display(), "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}
