use crate::jsonrpc::types::ResponseError;
use thiserror::Error;

/// Failure to split the inbound byte stream into a header block and a body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Message header must separate key and value using ':' (line: {line:?})")]
    InvalidHeader { line: String },

    #[error("Header must provide a Content-Length property.")]
    MissingContentLength,

    #[error("Content-Length value must be a number (got {value:?})")]
    InvalidContentLength { value: String },

    #[error("message content is not valid UTF-8: {reason}")]
    InvalidUtf8 { reason: String },

    #[error("message content is not valid JSON: {reason}")]
    MalformedJson { reason: String },
}

/// Error reported on the `on_error` events of readers and writers.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("{role} received error. Reason: {reason}")]
    Io { role: &'static str, reason: String },

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("{role} received error. Reason: {reason}")]
    Channel { role: &'static str, reason: String },

    #[error("{role} received error. Reason: unknown")]
    Unknown { role: &'static str },

    #[error("{role} is closed")]
    Closed { role: &'static str },
}

impl TransportError {
    pub(crate) fn io(role: &'static str, err: &std::io::Error) -> Self {
        let reason = err.to_string();
        if reason.is_empty() {
            TransportError::Unknown { role }
        } else {
            TransportError::Io { role, reason }
        }
    }

    pub(crate) fn channel(role: &'static str, err: &anyhow::Error) -> Self {
        let reason = err.to_string();
        if reason.is_empty() {
            TransportError::Unknown { role }
        } else {
            TransportError::Channel { role, reason }
        }
    }
}

/// Lifecycle violations raised synchronously at the call site.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection is closed.")]
    Closed,

    #[error("Connection is disposed.")]
    Disposed,

    #[error("Connection is already listening")]
    AlreadyListening,

    #[error("Connection is not listening")]
    NotListening,
}

impl ConnectionError {
    pub fn code(&self) -> i32 {
        match self {
            ConnectionError::Closed => 1,
            ConnectionError::Disposed => 2,
            ConnectionError::AlreadyListening => 3,
            ConnectionError::NotListening => 4,
        }
    }
}

/// Why an outgoing request did not produce a result.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error("Connection got disposed.")]
    Disposed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("failed to decode result: {0}")]
    InvalidResult(#[source] serde_json::Error),

    #[error("connection dropped before the response arrived")]
    Dropped,
}

impl RequestError {
    /// The JSON-RPC error when the peer (or the writer) answered with one.
    pub fn response_error(&self) -> Option<&ResponseError> {
        match self {
            RequestError::Response(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_transport_error_names_role() {
        let err = TransportError::Unknown { role: "Reader" };
        assert_eq!(err.to_string(), "Reader received error. Reason: unknown");
    }

    #[test]
    fn io_error_without_text_maps_to_unknown() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "");
        assert!(matches!(
            TransportError::io("Writer", &err),
            TransportError::Unknown { role: "Writer" }
        ));
    }

    #[test]
    fn connection_error_codes_are_distinct() {
        let codes = [
            ConnectionError::Closed.code(),
            ConnectionError::Disposed.code(),
            ConnectionError::AlreadyListening.code(),
            ConnectionError::NotListening.code(),
        ];
        assert_eq!(codes, [1, 2, 3, 4]);
    }
}
