//! In-memory state store for the relay.
//!
//! DESIGN
//! ======
//! `StateStore` holds the last-known-good `GlobalState`: the active widget
//! index plus per-widget parameter maps. It is owned by exactly one `Relay`
//! and mutated only from the relay's message handlers. Nothing is persisted;
//! a restarted relay starts from the default state.

use protocol::{GlobalState, WidgetIndex, widget_key};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct StateStore {
    state: GlobalState,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a pre-populated state.
    #[must_use]
    pub fn with_state(state: GlobalState) -> Self {
        Self { state }
    }

    #[must_use]
    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    /// Full copy of the current state, as sent in `state_sync`.
    #[must_use]
    pub fn snapshot(&self) -> GlobalState {
        self.state.clone()
    }

    #[must_use]
    pub fn active_widget(&self) -> WidgetIndex {
        self.state.active_widget_index
    }

    pub fn set_active_widget(&mut self, index: WidgetIndex) {
        self.state.active_widget_index = index;
    }

    /// Store one parameter value, creating the widget's map on first write.
    /// Returns the value it replaced, if any.
    pub fn set_parameter(&mut self, index: WidgetIndex, parameter: impl Into<String>, value: Value) -> Option<Value> {
        self.state
            .widget_settings
            .entry(widget_key(index))
            .or_default()
            .insert(parameter.into(), value)
    }

    #[must_use]
    pub fn parameter(&self, index: WidgetIndex, parameter: &str) -> Option<&Value> {
        self.state.parameter(index, parameter)
    }

    /// Number of widgets with at least one stored parameter.
    #[must_use]
    pub fn widget_count(&self) -> usize {
        self.state.widget_settings.len()
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
