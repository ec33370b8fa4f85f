//! Compiler capability and the compiled-artifact cache.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde_json::Value;
use tracing::debug;

use crate::config::CacheConfig;
use crate::context::ExecutionContext;
use crate::{Result, ScriptError};

/// Turns script source into an executable artifact and runs it.
///
/// Implementations must be shareable between threads; artifacts are shared
/// read-only between concurrent invocations.
pub trait ScriptCompiler: Send + Sync + 'static {
    type Artifact: Send + Sync + 'static;

    /// Compile `source`, failing with [`ScriptError::Compile`] on malformed input.
    fn compile(&self, name: &str, source: &str) -> Result<Self::Artifact>;

    /// Run `artifact` against a fresh context and return its raw result.
    fn evaluate(&self, artifact: &Self::Artifact, context: ExecutionContext) -> Result<Value>;
}

/// Compiled artifacts keyed by content hash.
///
/// Entries expire after a period without access. Failed compilations are
/// never stored.
pub struct ArtifactCache<A> {
    entries: Cache<String, Arc<A>>,
}

impl<A: Send + Sync + 'static> ArtifactCache<A> {
    pub fn new(idle_ttl: Duration, max_entries: Option<u64>) -> Self {
        let mut builder = Cache::builder().time_to_idle(idle_ttl);
        if let Some(max) = max_entries {
            builder = builder.max_capacity(max);
        }
        Self {
            entries: builder.build(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.idle_ttl_secs), config.max_entries)
    }

    /// Return the artifact for `content_hash`, running `compile` on a miss.
    ///
    /// Concurrent misses for the same hash wait for a single `compile` call
    /// and all observe its outcome.
    pub fn get_or_compile<F>(&self, content_hash: &str, compile: F) -> Result<Arc<A>>
    where
        F: FnOnce() -> Result<A>,
    {
        self.entries
            .try_get_with_by_ref(content_hash, || {
                debug!(hash = content_hash, "Compiling script");
                compile().map(Arc::new)
            })
            .map_err(|shared| {
                Arc::try_unwrap(shared).unwrap_or_else(|shared| ScriptError::Compile {
                    name: content_hash.to_string(),
                    message: shared.to_string(),
                })
            })
    }

    pub fn get(&self, content_hash: &str) -> Option<Arc<A>> {
        self.entries.get(content_hash)
    }

    pub fn invalidate(&self, content_hash: &str) {
        self.entries.invalidate(content_hash);
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Run expiration and other deferred bookkeeping now.
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }
}
