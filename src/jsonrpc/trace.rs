use crate::jsonrpc::types::NotificationType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trace verbosity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trace {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl Trace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trace::Off => "off",
            Trace::Messages => "messages",
            Trace::Verbose => "verbose",
        }
    }
}

/// Unknown values map to `Off`.
impl From<&str> for Trace {
    fn from(value: &str) -> Self {
        match value {
            "messages" => Trace::Messages,
            "verbose" => Trace::Verbose,
            _ => Trace::Off,
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for trace output. `data` is only present at `Trace::Verbose`.
pub trait Tracer: Send + Sync {
    fn log(&self, message: &str, data: Option<&str>);
}

/// Writes trace lines through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn log(&self, message: &str, data: Option<&str>) {
        match data {
            Some(data) => tracing::info!(target: "jsonrpc::trace", "{}\n{}", message, data),
            None => tracing::info!(target: "jsonrpc::trace", "{}", message),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetTraceParams {
    pub value: Trace,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogTraceParams {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<String>,
}

pub const SET_TRACE_NOTIFICATION: NotificationType<SetTraceParams> =
    NotificationType::new("$/setTraceNotification");

pub const LOG_TRACE_NOTIFICATION: NotificationType<LogTraceParams> =
    NotificationType::new("$/logTraceNotification");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trace_wire_values() {
        let params = SetTraceParams {
            value: Trace::Verbose,
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"value": "verbose"})
        );
        assert_eq!(Trace::from("messages"), Trace::Messages);
        assert_eq!(Trace::from("loud"), Trace::Off);
    }

    #[test]
    fn log_trace_verbose_is_optional() {
        let params: LogTraceParams = serde_json::from_value(json!({"message": "hi"})).unwrap();
        assert_eq!(params.verbose, None);
    }
}
