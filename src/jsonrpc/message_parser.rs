//! Shape-based discrimination of decoded JSON values.
//!
//! Order matters and the first match wins: `method` + `id` is a request,
//! `method` without `id` a notification, `id` with `result` or `error` a
//! response. Anything else is [`Message::Invalid`].
use crate::jsonrpc::error::FramingError;
use crate::jsonrpc::types::{Message, NotificationMessage, RequestMessage, ResponseMessage};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub fn parse_request(json: &Value) -> Option<RequestMessage> {
    if has_method(json) && json.get("id").is_some() {
        return from_value(json);
    }
    None
}

pub fn parse_notification(json: &Value) -> Option<NotificationMessage> {
    if has_method(json) && json.get("id").is_none() {
        return from_value(json);
    }
    None
}

pub fn parse_response(json: &Value) -> Option<ResponseMessage> {
    if json.get("id").is_some() && (json.get("result").is_some() || json.get("error").is_some())
    {
        return from_value(json);
    }
    None
}

pub fn parse_message(json: Value) -> Message {
    if has_method(&json) {
        if json.get("id").is_some() {
            return parse_request(&json)
                .map(Message::Request)
                .unwrap_or(Message::Invalid(json));
        }
        return parse_notification(&json)
            .map(Message::Notification)
            .unwrap_or(Message::Invalid(json));
    }
    match parse_response(&json) {
        Some(response) => Message::Response(response),
        None => Message::Invalid(json),
    }
}

/// Parse a full JSON payload into a `Message`. Only text that is not JSON at
/// all is an error; well-formed JSON of the wrong shape becomes `Invalid`.
pub fn parse_message_from_str(s: &str) -> Result<Message, FramingError> {
    let json: Value = serde_json::from_str(s).map_err(|e| FramingError::MalformedJson {
        reason: e.to_string(),
    })?;
    Ok(parse_message(json))
}

fn has_method(json: &Value) -> bool {
    json.get("method").map(Value::is_string).unwrap_or(false)
}

fn from_value<T: DeserializeOwned>(json: &Value) -> Option<T> {
    serde_json::from_value(json.clone()).ok()
}
