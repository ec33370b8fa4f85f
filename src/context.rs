//! Per-invocation execution namespaces.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::http::HttpClient;
use crate::logger::ExtensionLogger;
use crate::types::{ExecutionParameters, ReturnType};

/// Structured logger binding.
pub const LOG: &str = "log";
/// Caller-supplied extension logger binding.
pub const EXTENSION_LOGGER: &str = "extensionLogger";
/// JSON serialization helper binding.
pub const JSON: &str = "json";
/// Outbound HTTP binding.
pub const HTTP_CLIENT: &str = "simpleHttpClient";
/// Expected return type tag binding.
pub const RETURN_TYPE: &str = "returnType";

/// A value visible to a script under some name.
#[derive(Clone)]
pub enum Binding {
    /// `tracing` backed logger tagged with the script name.
    Log,
    ExtensionLogger(Arc<dyn ExtensionLogger>),
    Json,
    Http(Arc<dyn HttpClient>),
    ReturnType(ReturnType),
    /// Caller parameter, forwarded verbatim.
    Value(Value),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Log => f.write_str("Log"),
            Binding::ExtensionLogger(_) => f.write_str("ExtensionLogger(..)"),
            Binding::Json => f.write_str("Json"),
            Binding::Http(_) => f.write_str("Http(..)"),
            Binding::ReturnType(tag) => f.debug_tuple("ReturnType").field(tag).finish(),
            Binding::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Named bindings for exactly one script run.
#[derive(Debug)]
pub struct ExecutionContext {
    script: String,
    bindings: HashMap<String, Binding>,
}

impl ExecutionContext {
    /// Name of the script this context was built for.
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn into_bindings(self) -> HashMap<String, Binding> {
        self.bindings
    }
}

/// Builds fresh execution contexts.
///
/// Only holds capabilities that are safe to share; every call to
/// [`build`](Self::build) produces a new, unshared map.
#[derive(Clone)]
pub struct BindingBuilder {
    http: Arc<dyn HttpClient>,
}

impl BindingBuilder {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    /// Install the fixed bindings, then overlay the caller parameters.
    ///
    /// A parameter named like a fixed binding replaces it.
    pub fn build(
        &self,
        script: &str,
        parameters: Option<ExecutionParameters>,
        extension_logger: Arc<dyn ExtensionLogger>,
        return_type: ReturnType,
    ) -> ExecutionContext {
        let parameters = parameters.unwrap_or_default();
        let mut bindings = HashMap::with_capacity(parameters.len() + 5);

        bindings.insert(LOG.to_string(), Binding::Log);
        bindings.insert(
            EXTENSION_LOGGER.to_string(),
            Binding::ExtensionLogger(extension_logger),
        );
        bindings.insert(JSON.to_string(), Binding::Json);
        bindings.insert(HTTP_CLIENT.to_string(), Binding::Http(Arc::clone(&self.http)));
        bindings.insert(RETURN_TYPE.to_string(), Binding::ReturnType(return_type));

        for (name, value) in parameters {
            bindings.insert(name, Binding::Value(value));
        }

        ExecutionContext {
            script: script.to_string(),
            bindings,
        }
    }
}
