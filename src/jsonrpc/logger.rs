/// Logger collaborator used by the connection for protocol problems and
/// handler failures.
pub trait Logger: Send + Sync {
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    fn log(&self, message: &str);
}

/// Forwards to `tracing`; `log` maps to debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, message: &str) {
        tracing::error!(target: "jsonrpc", "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "jsonrpc", "{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "jsonrpc", "{}", message);
    }

    fn log(&self, message: &str) {
        tracing::debug!(target: "jsonrpc", "{}", message);
    }
}
