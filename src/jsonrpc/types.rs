use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved JSON-RPC error codes plus the two transport codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const SERVER_ERROR_START: i32 = -32099;
    pub const SERVER_ERROR_END: i32 = -32000;
    pub const MESSAGE_WRITE_ERROR: i32 = 1;
    pub const MESSAGE_READ_ERROR: i32 = 2;

    /// Whether `code` lies in the implementation-defined server error band.
    pub fn is_server_error(code: i32) -> bool {
        (SERVER_ERROR_START..=SERVER_ERROR_END).contains(&code)
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

// Keeps an explicit `null` distinct from an absent member.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Request identifier. Numeric `1` and textual `"1"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestMessage {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestMessage {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        RequestMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A reply. Exactly one of `result` / `error` is expected; `result` may be an
/// explicit `null`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    pub fn success(id: RequestId, result: Value) -> Self {
        ResponseMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        ResponseMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        NotificationMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Any message crossing the connection. The variant is decided by the shape
/// of the JSON object, see [`crate::jsonrpc::message_parser`].
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
    Notification(NotificationMessage),
    Invalid(Value),
}

impl Message {
    pub fn from_value(value: Value) -> Self {
        crate::jsonrpc::message_parser::parse_message(value)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Message::from_value)
    }
}

impl From<RequestMessage> for Message {
    fn from(m: RequestMessage) -> Self {
        Message::Request(m)
    }
}

impl From<ResponseMessage> for Message {
    fn from(m: ResponseMessage) -> Self {
        Message::Response(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Self {
        Message::Notification(m)
    }
}

/// Error carried by a response. Serializes to the JSON-RPC error literal and
/// omits `data` when absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ResponseError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        ResponseError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Unhandled method {}", method),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ResponseError::new(error_codes::INTERNAL_ERROR, message)
    }
}

/// Method name bound to parameter and result types.
pub struct RequestType<P, R> {
    method: &'static str,
    _marker: PhantomData<fn(P) -> R>,
}

impl<P, R> RequestType<P, R> {
    pub const fn new(method: &'static str) -> Self {
        RequestType {
            method,
            _marker: PhantomData,
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }
}

pub struct NotificationType<P> {
    method: &'static str,
    _marker: PhantomData<fn(P)>,
}

impl<P> NotificationType<P> {
    pub const fn new(method: &'static str) -> Self {
        NotificationType {
            method,
            _marker: PhantomData,
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CancelParams {
    pub id: RequestId,
}

pub const CANCEL_REQUEST: NotificationType<CancelParams> = NotificationType::new("$/cancelRequest");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_in_wire_order() {
        let request = RequestMessage::new(
            RequestId::Number(1),
            "math/add",
            Some(json!({"a": 2, "b": 3})),
        );
        let text = serde_json::to_string(&Message::Request(request)).unwrap();
        assert_eq!(
            text,
            r#"{"jsonrpc":"2.0","id":1,"method":"math/add","params":{"a":2,"b":3}}"#
        );
    }

    #[test]
    fn null_result_is_kept_on_both_sides() {
        let response = ResponseMessage::success(RequestId::from("a"), Value::Null);
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":"a","result":null}"#);

        let back: ResponseMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.result, Some(Value::Null));
        assert!(back.error.is_none());
    }

    #[test]
    fn response_error_omits_absent_data() {
        let err = ResponseError::new(error_codes::INVALID_PARAMS, "bad");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"code": -32602, "message": "bad"})
        );
        let err = err.with_data(json!([1]));
        assert_eq!(serde_json::to_value(&err).unwrap()["data"], json!([1]));
    }

    #[test]
    fn numeric_and_string_ids_differ() {
        assert_ne!(RequestId::from(1), RequestId::from("1"));
        assert_eq!(RequestId::from(1).to_string(), "1");
        assert_eq!(RequestId::from("1").to_string(), "1");
    }

    #[test]
    fn server_error_band() {
        assert!(error_codes::is_server_error(-32050));
        assert!(!error_codes::is_server_error(error_codes::INTERNAL_ERROR));
    }
}
