//! Test helpers for integration tests.
//!
//! Provides a recording extension logger, a compile-counting Lua compiler
//! and a fake HTTP client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::Value;

use extscript::{
    Config, ExecutionContext, ExtensionLogger, HttpClient, HttpRequest, HttpResponse,
    LuaArtifact, LuaCompiler, PoolFactory, Result, ScriptCompiler, ScriptingService,
    TokioWorkerPool,
};

/// Default timeout for waiting on async executions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One call received by [`RecordingLogger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Success(String),
    Error(String),
    Warning(String),
    Info(String),
}

/// Extension logger remembering every call.
#[derive(Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
    changed: Condvar,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, entry: LogEntry) {
        self.entries.lock().unwrap().push(entry);
        self.changed.notify_all();
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn successes(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| matches!(e, LogEntry::Success(_)))
            .count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Block until `terminal` success/error entries were logged by the engine.
    ///
    /// Only entries whose message starts like the engine's own messages count.
    pub fn wait_for_outcomes(&self, terminal: usize, timeout: Duration) -> Vec<LogEntry> {
        let guard = self.entries.lock().unwrap();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |entries| {
                entries.iter().filter(|e| is_outcome(e)).count() < terminal
            })
            .unwrap();
        guard.clone()
    }
}

fn is_outcome(entry: &LogEntry) -> bool {
    match entry {
        LogEntry::Success(message) => message == extscript::SUCCESS_MESSAGE,
        LogEntry::Error(message) => {
            message.starts_with("Error while executing script")
                || message.starts_with("Was not able to compile script")
        }
        _ => false,
    }
}

impl ExtensionLogger for RecordingLogger {
    fn log_success(&self, message: &str) {
        self.push(LogEntry::Success(message.to_string()));
    }

    fn log_error(&self, message: &str) {
        self.push(LogEntry::Error(message.to_string()));
    }

    fn log_warning(&self, message: &str) {
        self.push(LogEntry::Warning(message.to_string()));
    }

    fn log_info(&self, message: &str) {
        self.push(LogEntry::Info(message.to_string()));
    }
}

/// Upcast helper for the service API.
pub fn sink(logger: &Arc<RecordingLogger>) -> Arc<dyn ExtensionLogger> {
    logger.clone()
}

/// Lua compiler counting how often it compiles.
#[derive(Default)]
pub struct CountingCompiler {
    inner: LuaCompiler,
    compiles: AtomicUsize,
}

impl CountingCompiler {
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl ScriptCompiler for CountingCompiler {
    type Artifact = LuaArtifact;

    fn compile(&self, name: &str, source: &str) -> Result<LuaArtifact> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(name, source)
    }

    fn evaluate(&self, artifact: &LuaArtifact, context: ExecutionContext) -> Result<Value> {
        self.inner.evaluate(artifact, context)
    }
}

/// HTTP client answering every request with a canned response.
#[derive(Default)]
pub struct FakeHttp {
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl HttpClient for FakeHttp {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: r#"{"accepted":true}"#.to_string(),
        })
    }
}

/// Config with small pools for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pools.worker_threads = 2;
    config.pools.thread_name_prefix = "extscript-test".to_string();
    config
}

/// Lua service with tokio worker pools and a fake HTTP client.
pub fn lua_service() -> ScriptingService<CountingCompiler> {
    let config = test_config();
    service_with_factory(TokioWorkerPool::factory(&config.pools))
}

pub fn service_with_factory(factory: PoolFactory) -> ScriptingService<CountingCompiler> {
    ScriptingService::new(
        CountingCompiler::default(),
        Arc::new(FakeHttp::default()),
        factory,
        &test_config(),
    )
}
