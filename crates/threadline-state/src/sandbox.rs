//! Sandboxed evaluation of script channel initializers.
//!
//! Scripts run in an isolated Rhai engine that sees exactly two variables,
//! `vars` and `flow`. Imports are disabled, output is discarded, and every
//! evaluation is bounded by operation, size and depth limits plus a
//! wall-clock timeout.

use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::{Map, Value};

use threadline_core::error::StateError;

/// Variables made visible to an initializer script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptContext {
    /// Caller-supplied variables.
    pub vars: Map<String, Value>,
    /// Information about the flow being run.
    pub flow: Map<String, Value>,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    pub fn with_flow(mut self, key: impl Into<String>, value: Value) -> Self {
        self.flow.insert(key.into(), value);
        self
    }
}

/// Limits applied to every script evaluation.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    timeout: Duration,
    max_operations: u64,
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_operations: 100_000,
        }
    }
}

impl ScriptSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_operations(mut self, max_operations: u64) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// Evaluate `source` and return its result, which must be an object map.
    pub fn evaluate(&self, source: &str, ctx: &ScriptContext) -> Result<Map<String, Value>, StateError> {
        let engine = self.engine();

        let mut scope = Scope::new();
        scope.push_dynamic("vars", to_dynamic(&ctx.vars)?);
        scope.push_dynamic("flow", to_dynamic(&ctx.flow)?);

        let result: Dynamic = engine
            .eval_with_scope(&mut scope, source)
            .map_err(|e| self.map_eval_error(*e))?;

        match rhai::serde::from_dynamic::<Value>(&result) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(StateError::Script(format!(
                "initializer must evaluate to an object map, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(StateError::Script(format!("unsupported script result: {e}"))),
        }
    }

    fn engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        engine.set_max_call_levels(8);
        engine.set_max_expr_depths(32, 16);
        engine.set_max_string_size(64 * 1024);
        engine.set_max_array_size(1024);
        engine.set_max_map_size(256);
        engine.set_max_modules(0);
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});

        let started = Instant::now();
        let timeout = self.timeout;
        engine.on_progress(move |_| {
            if started.elapsed() > timeout {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
        engine
    }

    fn map_eval_error(&self, err: EvalAltResult) -> StateError {
        match err {
            EvalAltResult::ErrorTerminated(..) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "initializer script timed out");
                StateError::ScriptTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            }
            other => StateError::Script(other.to_string()),
        }
    }
}

fn to_dynamic(map: &Map<String, Value>) -> Result<Dynamic, StateError> {
    rhai::serde::to_dynamic(map)
        .map_err(|e| StateError::Script(format!("failed to inject script variables: {e}")))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluates_object_literal() {
        let result = ScriptSandbox::new()
            .evaluate(r#"#{ topic: "weather", count: 40 + 2 }"#, &ScriptContext::new())
            .unwrap();
        assert_eq!(Value::Object(result), json!({"topic": "weather", "count": 42}));
    }

    #[test]
    fn sees_vars_and_flow() {
        let ctx = ScriptContext::new()
            .with_var("city", json!("Kyoto"))
            .with_flow("id", json!("flow-7"));
        let result = ScriptSandbox::new()
            .evaluate(r#"#{ place: vars.city, origin: flow.id }"#, &ctx)
            .unwrap();
        assert_eq!(result["place"], json!("Kyoto"));
        assert_eq!(result["origin"], json!("flow-7"));
    }

    #[test]
    fn other_variables_are_undefined() {
        let err = ScriptSandbox::new()
            .evaluate("#{ leaked: state }", &ScriptContext::new())
            .unwrap_err();
        assert!(matches!(err, StateError::Script(_)));
    }

    #[test]
    fn non_map_result_is_rejected() {
        let err = ScriptSandbox::new()
            .evaluate("1 + 1", &ScriptContext::new())
            .unwrap_err();
        assert!(matches!(err, StateError::Script(ref msg) if msg.contains("a number")));
    }

    #[test]
    fn imports_are_disabled() {
        let err = ScriptSandbox::new()
            .evaluate(r#"import "os" as os; #{}"#, &ScriptContext::new())
            .unwrap_err();
        assert!(matches!(err, StateError::Script(_)));
    }

    #[test]
    fn operation_limit_stops_runaway_scripts() {
        let err = ScriptSandbox::new()
            .with_max_operations(1_000)
            .evaluate("let x = 0; loop { x += 1; }", &ScriptContext::new())
            .unwrap_err();
        assert!(matches!(err, StateError::Script(_)));
    }

    #[test]
    fn timeout_terminates_long_scripts() {
        let err = ScriptSandbox::new()
            .with_max_operations(0)
            .with_timeout(Duration::from_millis(50))
            .evaluate("let x = 0; loop { x += 1; }", &ScriptContext::new())
            .unwrap_err();
        assert!(matches!(err, StateError::ScriptTimeout { timeout_ms: 50 }));
    }
}
