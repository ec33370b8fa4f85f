//! Script execution service: synchronous execution and async dispatch.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::cache::{ArtifactCache, ScriptCompiler};
use crate::config::Config;
use crate::context::BindingBuilder;
use crate::http::{HttpClient, SimpleHttpClient};
use crate::logger::ExtensionLogger;
use crate::lua::{LuaCompiler, ResourceLimits};
use crate::pool::{Job, PoolFactory, PoolRegistry, TokioWorkerPool};
use crate::types::{ExecutionParameters, ExecutionPath, ScriptIdentity, ScriptReturn, ScriptValue};
use crate::{Result, ScriptError};

/// Message reported to the extension logger after a successful run.
pub const SUCCESS_MESSAGE: &str = "Script executed successfully";

/// Lazily fetches the source of a script; only called on a cache miss.
pub type SourceSupplier = Box<dyn FnOnce() -> Result<String> + Send + 'static>;

struct Inner<C: ScriptCompiler> {
    compiler: C,
    artifacts: ArtifactCache<C::Artifact>,
    bindings: BindingBuilder,
    pools: PoolRegistry,
}

/// Runs extension scripts.
///
/// Cloning is cheap; clones share the compiled-script cache and the worker
/// pools.
pub struct ScriptingService<C: ScriptCompiler = LuaCompiler> {
    inner: Arc<Inner<C>>,
}

impl<C: ScriptCompiler> Clone for ScriptingService<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ScriptingService<LuaCompiler> {
    /// Build a Lua service with a `reqwest` HTTP client and tokio backed
    /// worker pools.
    ///
    /// The service owns a blocking HTTP client. Call this and drop the last
    /// clone of the service outside of async tasks (a plain thread or
    /// `tokio::task::spawn_blocking`); dropping it on an async task panics.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let compiler = LuaCompiler::with_limits(ResourceLimits::from(&config.limits));
        let http = Arc::new(SimpleHttpClient::new(&config.http)?);
        Ok(Self::new(
            compiler,
            http,
            TokioWorkerPool::factory(&config.pools),
            config,
        ))
    }
}

impl<C: ScriptCompiler> ScriptingService<C> {
    pub fn new(
        compiler: C,
        http: Arc<dyn HttpClient>,
        pool_factory: PoolFactory,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                compiler,
                artifacts: ArtifactCache::from_config(&config.cache),
                bindings: BindingBuilder::new(http),
                pools: PoolRegistry::from_config(pool_factory, &config.pools),
            }),
        }
    }

    pub fn compiler(&self) -> &C {
        &self.inner.compiler
    }

    /// Execute a script identified by its content hash.
    ///
    /// `source` is only called when no compiled artifact is cached for the
    /// hash. Exactly one of `log_success` / `log_error` is reported to
    /// `logger` before returning.
    pub fn execute_script<T, F>(
        &self,
        identity: &ScriptIdentity,
        source: F,
        parameters: Option<ExecutionParameters>,
        logger: &Arc<dyn ExtensionLogger>,
    ) -> Result<T>
    where
        T: ScriptReturn,
        F: FnOnce() -> Result<String>,
    {
        let compiled = self
            .inner
            .artifacts
            .get_or_compile(&identity.content_hash, || {
                let source = source()?;
                self.inner.compiler.compile(&identity.name, &source)
            });

        match compiled {
            Ok(artifact) => self.run(&identity.name, &artifact, parameters, logger),
            Err(e) => Err(report_compile_error(&identity.name, e, logger.as_ref())),
        }
    }

    /// Compile and execute `source` without going through the cache.
    pub fn execute_source<T: ScriptReturn>(
        &self,
        name: &str,
        source: &str,
        parameters: Option<ExecutionParameters>,
        logger: &Arc<dyn ExtensionLogger>,
    ) -> Result<T> {
        match self.inner.compiler.compile(name, source) {
            Ok(artifact) => self.run(name, &artifact, parameters, logger),
            Err(e) => Err(report_compile_error(name, e, logger.as_ref())),
        }
    }

    /// Execute a script on the worker pool of `path` and return immediately.
    ///
    /// Never fails on the calling thread: outcomes are only visible through
    /// `logger`, and if no pool can be obtained nothing runs.
    pub fn execute_script_async(
        &self,
        path: &ExecutionPath,
        identity: ScriptIdentity,
        source: SourceSupplier,
        parameters: Option<ExecutionParameters>,
        logger: Arc<dyn ExtensionLogger>,
    ) {
        let service = self.clone();
        let job: Job = Box::new(move || {
            // Failures were already reported through the logger.
            let _ = service.execute_script::<JsonValue, _>(&identity, source, parameters, &logger);
        });
        self.dispatch(path, job);
    }

    fn dispatch(&self, path: &ExecutionPath, mut job: Job) {
        for _ in 0..2 {
            let pool = match self.inner.pools.pool_for(path) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(path = %path, error = %e, "No worker pool available, script not executed");
                    return;
                }
            };

            match pool.execute(job) {
                Ok(()) => return,
                // Evicted between lookup and submit; the next lookup creates a fresh pool.
                Err(rejected) => job = rejected,
            }
        }
        warn!(path = %path, "Worker pool rejected script, script not executed");
    }

    fn run<T: ScriptReturn>(
        &self,
        name: &str,
        artifact: &C::Artifact,
        parameters: Option<ExecutionParameters>,
        logger: &Arc<dyn ExtensionLogger>,
    ) -> Result<T> {
        let context = self
            .inner
            .bindings
            .build(name, parameters, Arc::clone(logger), T::RETURN_TYPE);

        let compiler = &self.inner.compiler;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| compiler.evaluate(artifact, context)))
            .unwrap_or_else(|payload| {
                Err(ScriptError::Evaluation {
                    name: name.to_string(),
                    message: format!("script panicked: {}", panic_message(payload.as_ref())),
                })
            })
            .and_then(|value| ScriptValue::new(T::RETURN_TYPE, value).convert::<T>());

        match outcome {
            Ok(value) => {
                debug!(script = name, "{}", SUCCESS_MESSAGE);
                logger.log_success(SUCCESS_MESSAGE);
                Ok(value)
            }
            Err(e) => {
                warn!(script = name, error = %e, "Error while executing script");
                logger.log_error(&format!("Error while executing script: {}", e));
                Err(e)
            }
        }
    }

    /// Drop the compiled artifact cached for `content_hash`.
    pub fn evict_script(&self, content_hash: &str) {
        self.inner.artifacts.invalidate(content_hash);
    }

    /// Evict and shut down the worker pool of `path`.
    pub fn evict_pool(&self, path: &ExecutionPath) {
        self.inner.pools.evict(path);
    }

    /// Number of cached compiled scripts.
    pub fn compiled_scripts(&self) -> u64 {
        self.inner.artifacts.run_pending_tasks();
        self.inner.artifacts.entry_count()
    }

    /// Number of live worker pools.
    pub fn active_pools(&self) -> u64 {
        self.inner.pools.len()
    }

    /// Expire idle artifacts and pools now instead of on the next access.
    pub fn run_maintenance(&self) {
        self.inner.artifacts.run_pending_tasks();
        self.inner.pools.run_pending_tasks();
    }

    /// Shut down every worker pool. Already queued scripts still finish.
    pub fn shutdown(&self) {
        self.inner.pools.shutdown_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn report_compile_error(
    name: &str,
    error: ScriptError,
    logger: &dyn ExtensionLogger,
) -> ScriptError {
    warn!(script = name, error = %error, "Was not able to compile script");
    logger.log_error(&format!("Was not able to compile script: {}", error));
    error
}
