//! Lua compiler and evaluator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{ChunkMode, HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Value, VmState};
use serde_json::Value as JsonValue;

use super::api;
use crate::cache::ScriptCompiler;
use crate::config::LimitsConfig;
use crate::context::ExecutionContext;
use crate::{Result, ScriptError};

/// Instructions executed between two limit checks.
const HOOK_INTERVAL: u32 = 10_000;

/// Globals removed from every execution state.
///
/// `load` must go: artifacts are loaded as binary chunks, so scripts must
/// not be able to feed bytecode of their own to the VM.
const REMOVED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "load",
    "loadfile",
    "dofile",
    "require",
    "package",
    "debug",
    "collectgarbage",
];

/// Resource limits for a single script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of instructions (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory_bytes,
        }
    }
}

/// Precompiled Lua chunk.
#[derive(Debug, Clone)]
pub struct LuaArtifact {
    name: String,
    bytecode: Vec<u8>,
}

impl LuaArtifact {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }
}

/// [`ScriptCompiler`] for Lua 5.4.
///
/// Compilation parses the chunk once and keeps its bytecode. Each evaluation
/// loads that bytecode into a brand new Lua state, so globals written by one
/// run are never visible to another.
#[derive(Debug, Clone, Default)]
pub struct LuaCompiler {
    limits: ResourceLimits,
}

impl LuaCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Create an isolated Lua state for one evaluation.
    fn new_state(&self) -> Result<Lua> {
        // SAFETY: binary chunks are only ever produced by `compile` from a
        // state of the same build, and scripts lose access to `load` below.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::new()) };

        Self::apply_sandbox(&lua)?;

        if self.limits.max_memory > 0 {
            lua.set_memory_limit(self.limits.max_memory)
                .map_err(|e| ScriptError::Configuration(format!("Failed to set memory limit: {}", e)))?;
        }

        if self.limits.max_instructions > 0 {
            let count = Arc::new(AtomicU64::new(0));
            let limit = self.limits.max_instructions;

            lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| {
                    let current = count.fetch_add(HOOK_INTERVAL as u64, Ordering::SeqCst)
                        + HOOK_INTERVAL as u64;
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "Script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        Ok(lua)
    }

    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals.set(*name, Value::Nil).map_err(|e| {
                ScriptError::Configuration(format!("Failed to disable {}: {}", name, e))
            })?;
        }
        Ok(())
    }
}

impl ScriptCompiler for LuaCompiler {
    type Artifact = LuaArtifact;

    fn compile(&self, name: &str, source: &str) -> Result<LuaArtifact> {
        let lua = Lua::new();
        let function = lua
            .load(source)
            .set_name(format!("={}", name))
            .into_function()
            .map_err(|e| ScriptError::Compile {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        Ok(LuaArtifact {
            name: name.to_string(),
            bytecode: function.dump(false),
        })
    }

    fn evaluate(&self, artifact: &LuaArtifact, context: ExecutionContext) -> Result<JsonValue> {
        let evaluation_error = |e: mlua::Error| ScriptError::Evaluation {
            name: artifact.name.clone(),
            message: e.to_string(),
        };

        let lua = self.new_state()?;
        api::install(&lua, context).map_err(evaluation_error)?;

        let value: Value = lua
            .load(artifact.bytecode.as_slice())
            .set_name(format!("={}", artifact.name))
            .set_mode(ChunkMode::Binary)
            .eval()
            .map_err(evaluation_error)?;

        lua.from_value(value).map_err(|e| ScriptError::Evaluation {
            name: artifact.name.clone(),
            message: format!("unsupported return value: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BindingBuilder;
    use crate::http::{HttpClient, HttpRequest, HttpResponse};
    use crate::logger::ExtensionLogger;
    use crate::types::{ExecutionParameters, ReturnType};
    use serde_json::json;

    struct NullHttp;

    impl HttpClient for NullHttp {
        fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            Ok(HttpResponse::default())
        }
    }

    struct NullLogger;

    impl ExtensionLogger for NullLogger {
        fn log_success(&self, _message: &str) {}
        fn log_error(&self, _message: &str) {}
    }

    fn context(params: Option<ExecutionParameters>) -> ExecutionContext {
        BindingBuilder::new(Arc::new(NullHttp)).build(
            "test",
            params,
            Arc::new(NullLogger),
            ReturnType::Any,
        )
    }

    fn run(compiler: &LuaCompiler, source: &str) -> Result<JsonValue> {
        let artifact = compiler.compile("test", source)?;
        compiler.evaluate(&artifact, context(None))
    }

    #[test]
    fn test_basic_execution() {
        let compiler = LuaCompiler::new();
        assert_eq!(run(&compiler, "return 1 + 2").unwrap(), json!(3));
    }

    #[test]
    fn test_string_operations() {
        let compiler = LuaCompiler::new();
        assert_eq!(
            run(&compiler, r#"return string.upper("hello")"#).unwrap(),
            json!("HELLO")
        );
    }

    #[test]
    fn test_table_result() {
        let compiler = LuaCompiler::new();
        let value = run(&compiler, r#"return { total = 3, currency = "EUR" }"#).unwrap();
        assert_eq!(value, json!({"total": 3, "currency": "EUR"}));
    }

    #[test]
    fn test_sequence_result() {
        let compiler = LuaCompiler::new();
        let value = run(&compiler, "local t = {1, 2, 3}; table.insert(t, 4); return t").unwrap();
        assert_eq!(value, json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_no_return_is_null() {
        let compiler = LuaCompiler::new();
        assert_eq!(run(&compiler, "local x = 1").unwrap(), JsonValue::Null);
    }

    #[test]
    fn test_parameters_visible() {
        let compiler = LuaCompiler::new();
        let artifact = compiler.compile("test", "return x + 1").unwrap();
        let params = ExecutionParameters::new().with("x", 41);

        let value = compiler.evaluate(&artifact, context(Some(params))).unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn test_artifact_reused_across_runs() {
        let compiler = LuaCompiler::new();
        let artifact = compiler.compile("test", "return x * 2").unwrap();

        for x in 1..=3 {
            let params = ExecutionParameters::new().with("x", x);
            let value = compiler.evaluate(&artifact, context(Some(params))).unwrap();
            assert_eq!(value, json!(x * 2));
        }
    }

    #[test]
    fn test_globals_do_not_leak_between_runs() {
        let compiler = LuaCompiler::new();
        let artifact = compiler
            .compile(
                "test",
                "local seen = counter ~= nil; counter = 1; return seen",
            )
            .unwrap();

        assert_eq!(compiler.evaluate(&artifact, context(None)).unwrap(), json!(false));
        assert_eq!(compiler.evaluate(&artifact, context(None)).unwrap(), json!(false));
    }

    #[test]
    fn test_syntax_error() {
        let compiler = LuaCompiler::new();
        let err = compiler.compile("broken", "this is not valid lua").unwrap_err();
        assert!(matches!(err, ScriptError::Compile { ref name, .. } if name == "broken"));
    }

    #[test]
    fn test_runtime_error() {
        let compiler = LuaCompiler::new();
        let err = run(&compiler, "error('test error')").unwrap_err();
        assert!(matches!(err, ScriptError::Evaluation { .. }));
        assert!(err.to_string().contains("test error"));
    }

    #[test]
    fn test_nil_access() {
        let compiler = LuaCompiler::new();
        assert!(run(&compiler, "local x = nil; return x.field").is_err());
    }

    #[test]
    fn test_function_result_rejected() {
        let compiler = LuaCompiler::new();
        let err = run(&compiler, "return function() end").unwrap_err();
        assert!(err.to_string().contains("unsupported return value"));
    }

    #[test]
    fn test_sandbox_removes_globals() {
        let compiler = LuaCompiler::new();
        let value = run(
            &compiler,
            "return os == nil and io == nil and load == nil and require == nil and debug == nil",
        )
        .unwrap();
        assert_eq!(value, json!(true));
    }

    #[test]
    fn test_instruction_limit() {
        let compiler = LuaCompiler::with_limits(ResourceLimits {
            max_instructions: 1000,
            max_memory: 0,
        });

        let err = run(&compiler, "while true do end").unwrap_err();
        assert!(err.to_string().contains("instruction limit"));
    }

    #[test]
    fn test_memory_limit() {
        let compiler = LuaCompiler::with_limits(ResourceLimits {
            max_instructions: 0,
            max_memory: 1024 * 100, // 100KB
        });

        let result = run(
            &compiler,
            r#"
            local t = {}
            for i = 1, 100000 do
                t[i] = string.rep("x", 1000)
            end
        "#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_limits_from_config() {
        let config = LimitsConfig {
            max_instructions: 5,
            max_memory_bytes: 7,
        };
        let limits = ResourceLimits::from(&config);
        assert_eq!(limits.max_instructions, 5);
        assert_eq!(limits.max_memory, 7);
    }
}
