//! Display-instance side of clock settings sync.
//!
//! ARCHITECTURE
//! ============
//! - `session`: `SyncSession`, the reconnecting websocket link to the relay
//! - `adapter`: how a sync core reads and writes a widget's parameters
//! - `config`: relay URL and reconnect interval

pub mod adapter;
pub mod config;
pub mod session;

pub use adapter::{
    AdapterError, AdapterRegistry, ParameterSet, ParameterTarget, apply_change, apply_parameters, extract_parameters,
    standard_registry,
};
pub use config::SyncConfig;
pub use session::{ConnectionPhase, StatusIndicator, SyncSession};
