//! extscript - extension script execution engine.
//!
//! Runs small, dynamically supplied scripts at an application's extension
//! points. Compiled scripts are cached by content hash, every run gets its
//! own isolated namespace, and asynchronous runs are dispatched to one worker
//! pool per execution path.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod logger;
pub mod logging;
pub mod lua;
pub mod pool;
pub mod service;
pub mod types;

pub use cache::{ArtifactCache, ScriptCompiler};
pub use config::Config;
pub use context::{Binding, BindingBuilder, ExecutionContext};
pub use error::{Result, ScriptError};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, SimpleHttpClient};
pub use logger::{ExtensionLogger, TracingExtensionLogger};
pub use lua::{LuaArtifact, LuaCompiler, ResourceLimits};
pub use pool::{Job, PoolFactory, PoolRegistry, TokioWorkerPool, WorkerPool};
pub use service::{ScriptingService, SourceSupplier, SUCCESS_MESSAGE};
pub use types::{
    content_hash, ExecutionParameters, ExecutionPath, ReturnType, ScriptIdentity, ScriptReturn,
    ScriptValue,
};
