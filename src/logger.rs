//! Logging sink supplied by the embedding application.

use tracing::{error, info, warn};

/// Receives the outcome of script executions.
///
/// The engine calls exactly one of [`log_success`](Self::log_success) or
/// [`log_error`](Self::log_error) per execution attempt. Scripts can call all
/// four methods through the `extensionLogger` binding.
pub trait ExtensionLogger: Send + Sync {
    fn log_success(&self, message: &str);

    fn log_error(&self, message: &str);

    fn log_warning(&self, message: &str) {
        warn!(target: "extscript::extension", "{}", message);
    }

    fn log_info(&self, message: &str) {
        info!(target: "extscript::extension", "{}", message);
    }
}

/// Extension logger that forwards everything to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingExtensionLogger {
    extension: String,
}

impl TracingExtensionLogger {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl ExtensionLogger for TracingExtensionLogger {
    fn log_success(&self, message: &str) {
        info!(extension = %self.extension, "{}", message);
    }

    fn log_error(&self, message: &str) {
        error!(extension = %self.extension, "{}", message);
    }

    fn log_warning(&self, message: &str) {
        warn!(extension = %self.extension, "{}", message);
    }

    fn log_info(&self, message: &str) {
        info!(extension = %self.extension, "{}", message);
    }
}
