use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

/// Engine-wide settings, passed explicitly to [`crate::Engine::with_config`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Check internal invariants (stale run buffers, output bounds) and
    /// return `Error::InvariantViolation` when one fails.
    pub debug_assertions: bool,
    /// Maintain plans incrementally. When false every `apply_deltas`
    /// recomputes the plan from scratch.
    pub incremental: bool,
    /// Build closure trees for expressions. When false every expression is
    /// evaluated by the interpreter.
    pub compile_expressions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug_assertions: false,
            incremental: true,
            compile_expressions: true,
        }
    }
}

impl EngineConfig {
    /// Debug configuration used by tests: every invariant check enabled.
    pub fn debug() -> Self {
        Self {
            debug_assertions: true,
            ..Self::default()
        }
    }

    /// Parse from a JSON object; missing keys keep their defaults.
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}
