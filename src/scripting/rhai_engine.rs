//! Sandboxed Rhai engine for automation hooks.
//!
//! Hook scripts define two functions:
//!
//! ```rhai
//! fn initSchedule() { }   // once, when automation starts
//! fn onSchedule() { }     // at every queued time
//! ```
//!
//! # Sandbox
//!
//! - Operation budget, call depth and string/array/map size limits
//! - `eval` disabled, `import` resolves nothing
//! - `print`/`debug` go to `tracing` under the `automation` target
//! - Hardware and file access only through the bindings registered by
//!   [`register_station`](super::bindings::register_station)
//!
//! Hooks run on the blocking pool, so bindings may block on station futures.

use super::bindings::{register_station, StationBindings};
use crate::automation::ScheduleHooks;
use crate::config::AutomationConfig;
use crate::error::{AppResult, StationError};
use async_trait::async_trait;
use rhai::{CallFnOptions, Dynamic, Engine, Scope, AST};
use std::sync::Arc;
use tracing::{debug, info};

/// Hook run once when automation starts
pub const INIT_HOOK: &str = "initSchedule";
/// Hook run at every queued time
pub const SCHEDULE_HOOK: &str = "onSchedule";

/// Resource limits for one hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookLimits {
    /// Operations before the script is aborted
    pub max_operations: u64,
    /// Nested function calls
    pub max_call_levels: usize,
    /// Bytes per string
    pub max_string_size: usize,
    /// Elements per array
    pub max_array_size: usize,
    /// Entries per object map
    pub max_map_size: usize,
}

impl Default for HookLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 32,
            max_string_size: 64 * 1024,
            max_array_size: 100_000,
            max_map_size: 1_000,
        }
    }
}

impl From<&AutomationConfig> for HookLimits {
    fn from(config: &AutomationConfig) -> Self {
        Self {
            max_operations: config.max_operations,
            ..Self::default()
        }
    }
}

/// Compiles hook scripts against a sandboxed engine.
pub struct HookEngine {
    engine: Arc<Engine>,
}

impl HookEngine {
    /// Engine without station bindings; enough to check a script compiles.
    pub fn new(limits: HookLimits) -> Self {
        Self {
            engine: Arc::new(sandboxed(limits)),
        }
    }

    /// Engine whose scripts can reach the station through `bindings`.
    pub fn with_station(limits: HookLimits, bindings: StationBindings) -> Self {
        let mut engine = sandboxed(limits);
        register_station(&mut engine, bindings);
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Compile `script` and check it defines both hooks without parameters.
    pub fn compile(&self, script: &str) -> AppResult<RhaiHooks> {
        let ast = self
            .engine
            .compile(script)
            .map_err(|e| StationError::Script(format!("compile error: {e}")))?;

        for hook in [INIT_HOOK, SCHEDULE_HOOK] {
            let defined = ast
                .iter_functions()
                .any(|f| f.name == hook && f.params.is_empty());
            if !defined {
                return Err(StationError::Script(format!(
                    "script must define `fn {hook}()`"
                )));
            }
        }

        Ok(RhaiHooks {
            engine: self.engine.clone(),
            ast: Arc::new(ast),
        })
    }
}

fn sandboxed(limits: HookLimits) -> Engine {
    let mut engine = Engine::new();

    let max_operations = limits.max_operations;
    engine.on_progress(move |count| {
        if count > max_operations {
            Some(format!("Safety limit exceeded: maximum {max_operations} operations").into())
        } else {
            None
        }
    });
    engine
        .set_max_call_levels(limits.max_call_levels)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size);

    engine.disable_symbol("eval");
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());

    engine.on_print(|text| info!(target: "automation", "{text}"));
    engine.on_debug(|text, source, pos| {
        debug!(target: "automation", source = source.unwrap_or("hooks"), %pos, "{text}")
    });
    engine
}

/// Compiled `initSchedule`/`onSchedule` pair
#[derive(Clone)]
pub struct RhaiHooks {
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

impl RhaiHooks {
    /// Call `name` on the blocking pool.
    async fn call(&self, name: &'static str) -> AppResult<()> {
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        tokio::task::spawn_blocking(move || {
            let mut scope = Scope::new();
            engine
                .call_fn_with_options::<Dynamic>(
                    CallFnOptions::new().eval_ast(false),
                    &mut scope,
                    &ast,
                    name,
                    (),
                )
                .map(|_| ())
                .map_err(|e| StationError::Script(format!("{name}: {e}")))
        })
        .await
        .map_err(|e| StationError::Script(format!("{name} task join error: {e}")))?
    }
}

#[async_trait]
impl ScheduleHooks for RhaiHooks {
    async fn init_schedule(&self) -> AppResult<()> {
        self.call(INIT_HOOK).await
    }

    async fn on_schedule(&self) -> AppResult<()> {
        self.call(SCHEDULE_HOOK).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::DEFAULT_HOOKS;

    fn engine() -> HookEngine {
        HookEngine::new(HookLimits::default())
    }

    #[test]
    fn test_default_hooks_compile() {
        assert!(engine().compile(DEFAULT_HOOKS).is_ok());
    }

    #[test]
    fn test_missing_hook_rejected() {
        let err = engine().compile("fn initSchedule() {}").err().unwrap();
        assert!(err.to_string().contains("onSchedule"));
    }

    #[test]
    fn test_hook_with_parameters_rejected() {
        let result = engine().compile("fn initSchedule() {} fn onSchedule(x) {}");
        assert!(matches!(result, Err(StationError::Script(_))));
    }

    #[test]
    fn test_eval_disabled() {
        let script = r#"fn initSchedule() { eval("1") } fn onSchedule() {}"#;
        assert!(engine().compile(script).is_err());
    }

    #[tokio::test]
    async fn test_operation_limit() {
        let hooks = HookEngine::new(HookLimits {
            max_operations: 100,
            ..HookLimits::default()
        })
        .compile("fn initSchedule() { loop { } } fn onSchedule() {}")
        .unwrap();

        let err = hooks.init_schedule().await.unwrap_err();
        assert!(matches!(err, StationError::Script(ref msg) if msg.starts_with("initSchedule")));
    }

    #[tokio::test]
    async fn test_top_level_statements_not_rerun() {
        let hooks = engine()
            .compile("throw \"top level\"; fn initSchedule() {} fn onSchedule() {}")
            .unwrap();
        assert!(hooks.on_schedule().await.is_ok());
    }
}
