//! Parameter adapters: how the sync core reads and writes widget settings.
//!
//! A widget (clock face) exposes a named list of parameters. The sync core
//! never knows the concrete widget type; it goes through `ParameterTarget`,
//! and picks a concrete widget by tag through `AdapterRegistry`.

use std::collections::HashMap;

use protocol::{ParameterChange, ParameterMap};
use serde_json::Value;
use tracing::debug;

// =============================================================================
// STANDARD PARAMETER NAMES
// =============================================================================

pub const SIZE: &str = "SIZE";
pub const COLOR: &str = "COLOR";
pub const FONT: &str = "FONT";
pub const FONTSIZE: &str = "FONTSIZE";
pub const FONT_COLOUR: &str = "FONT COLOUR";
pub const RENDERER: &str = "RENDERER";

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("widget has no parameter `{0}`")]
    UnknownParameter(String),
    #[error("invalid value for `{parameter}`: expected {expected}, got {value}")]
    InvalidValue { parameter: String, expected: &'static str, value: Value },
    #[error("no widget registered for tag `{0}`")]
    UnknownWidget(String),
}

// =============================================================================
// TARGET
// =============================================================================

/// A widget whose settings can be read and written by name.
pub trait ParameterTarget: Send {
    /// Every parameter this widget understands, in display order.
    fn parameter_names(&self) -> &[String];

    fn parameter(&self, name: &str) -> Option<Value>;

    /// # Errors
    ///
    /// [`AdapterError::UnknownParameter`] if the widget lacks `name`, or
    /// [`AdapterError::InvalidValue`] if it cannot take `value`.
    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), AdapterError>;
}

/// Current values of every parameter the widget exposes.
#[must_use]
pub fn extract_parameters(target: &dyn ParameterTarget) -> ParameterMap {
    target
        .parameter_names()
        .iter()
        .filter_map(|name| target.parameter(name).map(|value| (name.clone(), value)))
        .collect()
}

/// Write every entry of `params` the widget accepts. Returns how many were
/// applied; unknown or rejected entries are skipped.
pub fn apply_parameters(target: &mut dyn ParameterTarget, params: &ParameterMap) -> usize {
    let mut applied = 0;
    for (name, value) in params {
        match target.set_parameter(name, value.clone()) {
            Ok(()) => applied += 1,
            Err(e) => debug!(parameter = %name, error = %e, "adapter: skipping parameter"),
        }
    }
    applied
}

/// Apply one relayed change to the widget it names.
///
/// # Errors
///
/// Whatever the widget's `set_parameter` rejects.
pub fn apply_change(target: &mut dyn ParameterTarget, change: &ParameterChange) -> Result<(), AdapterError> {
    target.set_parameter(&change.parameter, change.value.clone())
}

// =============================================================================
// PARAMETER SET
// =============================================================================

/// Map-backed widget with a fixed parameter list and per-parameter defaults.
///
/// A write must keep the JSON kind of the default (number, string, bool).
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    names: Vec<String>,
    values: ParameterMap,
}

impl ParameterSet {
    pub fn new<'a>(defaults: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let mut names = Vec::new();
        let mut values = ParameterMap::new();
        for (name, value) in defaults {
            if values.insert(name.to_owned(), value).is_none() {
                names.push(name.to_owned());
            }
        }
        Self { names, values }
    }

    #[must_use]
    pub fn values(&self) -> &ParameterMap {
        &self.values
    }
}

impl ParameterTarget for ParameterSet {
    fn parameter_names(&self) -> &[String] {
        &self.names
    }

    fn parameter(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), AdapterError> {
        let Some(current) = self.values.get_mut(name) else {
            return Err(AdapterError::UnknownParameter(name.to_owned()));
        };
        let expected = json_kind(current);
        if json_kind(&value) != expected {
            return Err(AdapterError::InvalidValue { parameter: name.to_owned(), expected, value });
        }
        *current = value;
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

type Factory = Box<dyn Fn() -> Box<dyn ParameterTarget> + Send + Sync>;

/// Widget-type tag → constructor.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, Factory>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `tag`.
    pub fn register<T, F>(&mut self, tag: impl Into<String>, factory: F)
    where
        T: ParameterTarget + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factories
            .insert(tag.into(), Box::new(move || Box::new(factory()) as Box<dyn ParameterTarget>));
    }

    /// # Errors
    ///
    /// [`AdapterError::UnknownWidget`] if nothing is registered for `tag`.
    pub fn create(&self, tag: &str) -> Result<Box<dyn ParameterTarget>, AdapterError> {
        self.factories
            .get(tag)
            .map(|factory| factory())
            .ok_or_else(|| AdapterError::UnknownWidget(tag.to_owned()))
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

/// Registry of the stock clock faces, keyed by tag, with their default
/// settings. The order of [`STANDARD_WIDGETS`] is the display's widget index.
#[must_use]
pub fn standard_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for &tag in STANDARD_WIDGETS {
        registry.register(tag, move || standard_widget(tag));
    }
    registry
}

/// Stock clock-face tags, in widget-index order.
pub const STANDARD_WIDGETS: &[&str] = &["analog", "digital", "seven-segment", "ascii-art", "dseg"];

fn standard_widget(tag: &str) -> ParameterSet {
    use serde_json::json;

    match tag {
        "analog" => ParameterSet::new([("CLOCK MODEL", json!(0)), (SIZE, json!(1.0)), (COLOR, json!(0))]),
        "digital" | "ascii-art" => {
            ParameterSet::new([(FONT, json!(0)), (FONTSIZE, json!(1.0)), (FONT_COLOUR, json!(0))])
        }
        "seven-segment" => ParameterSet::new([(FONTSIZE, json!(1.0)), (FONT_COLOUR, json!(1)), (RENDERER, json!(0))]),
        _ => ParameterSet::new([
            (FONT, json!(0)),
            ("STYLE", json!(0)),
            (FONTSIZE, json!(1.0)),
            (FONT_COLOUR, json!(0)),
            (RENDERER, json!(0)),
        ]),
    }
}

#[cfg(test)]
#[path = "adapter_test.rs"]
mod tests;
