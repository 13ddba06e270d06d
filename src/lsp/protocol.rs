// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC message types and `Content-Length` framing.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{LspError, Result};

/// Largest header block accepted before the `\r\n\r\n` terminator.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Largest body accepted in a single frame.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

fn default_null() -> serde_json::Value {
    serde_json::Value::Null
}

/// A request sent to the server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

impl RequestMessage {
    /// Builds a JSON-RPC 2.0 request.
    #[must_use]
    pub fn new(id: RequestId, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// A response, either to one of our requests or from us to a server request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request being answered.
    pub id: Option<RequestId>,
    /// Result on success. JSON `null` deserializes to `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// A notification (no id, no response).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

impl NotificationMessage {
    /// Builds a JSON-RPC 2.0 notification.
    #[must_use]
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC request id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id. All ids we allocate are numbers.
    Number(i64),
    /// String id, only ever seen on server-originated requests.
    String(String),
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseError {
    /// Error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional extra data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// An incoming message, classified by the fields it carries.
#[derive(Debug)]
pub enum Incoming {
    /// Has `id` and no `method`.
    Response(ResponseMessage),
    /// Has both `id` and `method`.
    Request(RequestMessage),
    /// Has `method` and no `id`.
    Notification(NotificationMessage),
}

impl Incoming {
    /// Classifies a decoded frame body.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::ProtocolViolation`] if the body is not JSON or does
    /// not have the shape of any JSON-RPC message.
    pub fn parse(body: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| LspError::ProtocolViolation(format!("frame body is not JSON: {e}")))?;

        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        let shape = |e: serde_json::Error| {
            LspError::ProtocolViolation(format!("malformed JSON-RPC message: {e}"))
        };

        if has_method {
            return if has_id {
                serde_json::from_value(value)
                    .map(Self::Request)
                    .map_err(shape)
            } else {
                serde_json::from_value(value)
                    .map(Self::Notification)
                    .map_err(shape)
            };
        }

        // Responses may carry `"id": null` when the server could not read our id.
        if value.get("id").is_some() {
            return serde_json::from_value(value)
                .map(Self::Response)
                .map_err(shape);
        }

        Err(LspError::ProtocolViolation(
            "message has neither id nor method".to_string(),
        ))
    }
}

/// Serializes a message and prepends its `Content-Length` header.
///
/// # Errors
///
/// Returns [`LspError::ProtocolViolation`] if the message cannot be serialized.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| LspError::ProtocolViolation(format!("cannot serialize message: {e}")))?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses one `Content-Length` framed message from the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is untouched in
/// that case. On success the frame is consumed from the buffer.
///
/// # Errors
///
/// Returns [`LspError::ProtocolViolation`] for a non-numeric or missing
/// `Content-Length`, a header block that grows past [`MAX_HEADER_BYTES`]
/// without a terminator, an oversized body, or non-UTF-8 content.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<String>> {
    let Some(header_len) = buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
    else {
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(LspError::ProtocolViolation(format!(
                "no header terminator within {MAX_HEADER_BYTES} bytes"
            )));
        }
        return Ok(None);
    };

    let headers = std::str::from_utf8(&buffer[..header_len])
        .map_err(|_| LspError::ProtocolViolation("header is not UTF-8".to_string()))?;

    let content_length = parse_content_length(headers)?;
    if content_length > MAX_BODY_BYTES {
        return Err(LspError::ProtocolViolation(format!(
            "Content-Length {content_length} exceeds maximum {MAX_BODY_BYTES}"
        )));
    }

    let body_start = header_len + HEADER_TERMINATOR.len();
    if buffer.len() < body_start + content_length {
        return Ok(None);
    }

    buffer.advance(body_start);
    let body = buffer.split_to(content_length);
    String::from_utf8(body.to_vec())
        .map(Some)
        .map_err(|_| LspError::ProtocolViolation("body is not UTF-8".to_string()))
}

fn parse_content_length(headers: &str) -> Result<usize> {
    let mut content_length = None;

    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(LspError::ProtocolViolation(format!(
                "malformed header line: {line:?}"
            )));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let len = value.trim().parse::<usize>().map_err(|_| {
                LspError::ProtocolViolation(format!(
                    "non-numeric Content-Length: {:?}",
                    value.trim()
                ))
            })?;
            content_length = Some(len);
        }
    }

    content_length
        .ok_or_else(|| LspError::ProtocolViolation("missing Content-Length header".to_string()))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_message() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let raw = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut buffer = BytesMut::from(raw.as_str());

        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, Some(body.to_string()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_incomplete_header() {
        let mut buffer = BytesMut::from("Content-Length: 10\r\n");
        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, None);
        assert_eq!(buffer.len(), 20);
    }

    #[test]
    fn test_parse_incomplete_body() {
        let mut buffer = BytesMut::from("Content-Length: 100\r\n\r\n{\"partial\":");
        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_parse_across_chunks() {
        let body = r#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        let raw = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let (first, second) = raw.split_at(9);

        let mut buffer = BytesMut::from(first);
        assert_eq!(try_parse_message(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(second.as_bytes());
        assert_eq!(
            try_parse_message(&mut buffer).unwrap(),
            Some(body.to_string())
        );
    }

    #[test]
    fn test_parse_multiple_messages() {
        let body1 = r#"{"jsonrpc":"2.0","id":1}"#;
        let body2 = r#"{"jsonrpc":"2.0","id":2}"#;
        let raw = format!(
            "Content-Length: {}\r\n\r\n{}Content-Length: {}\r\n\r\n{}",
            body1.len(),
            body1,
            body2.len(),
            body2
        );
        let mut buffer = BytesMut::from(raw.as_str());

        let result1 = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result1, Some(body1.to_string()));

        let result2 = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result2, Some(body2.to_string()));

        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_case_insensitive_header_and_extra_headers() {
        let body = r#"{"test":true}"#;
        let raw = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buffer = BytesMut::from(raw.as_str());

        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, Some(body.to_string()));
    }

    #[test]
    fn test_non_numeric_length_is_violation() {
        let mut buffer = BytesMut::from("Content-Length: abc\r\n\r\n{}");
        let err = try_parse_message(&mut buffer).unwrap_err();
        assert!(matches!(err, LspError::ProtocolViolation(_)), "{err:?}");
    }

    #[test]
    fn test_missing_length_is_violation() {
        let mut buffer = BytesMut::from("Content-Type: text/plain\r\n\r\n{}");
        let err = try_parse_message(&mut buffer).unwrap_err();
        assert!(matches!(err, LspError::ProtocolViolation(_)));
    }

    #[test]
    fn test_unterminated_header_is_violation() {
        let garbage = "X".repeat(MAX_HEADER_BYTES + 1);
        let mut buffer = BytesMut::from(garbage.as_str());
        let err = try_parse_message(&mut buffer).unwrap_err();
        assert!(matches!(err, LspError::ProtocolViolation(_)));
    }

    #[test]
    fn test_encode_counts_bytes_not_chars() {
        let msg = NotificationMessage::new("note", serde_json::json!({ "text": "héllo" }));
        let frame = encode_message(&msg).unwrap();

        let mut buffer = BytesMut::from(frame.as_slice());
        let body = try_parse_message(&mut buffer).unwrap().unwrap();
        let decoded: NotificationMessage = serde_json::from_str(&body).unwrap();
        assert_eq!(decoded.params["text"], "héllo");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_request_id_string() {
        let json = r#"{"jsonrpc":"2.0","id":"abc-123","method":"test"}"#;
        let msg: RequestMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, RequestId::String("abc-123".to_string()));
    }

    #[test]
    fn test_response_null_result() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let msg: ResponseMessage = serde_json::from_str(json).unwrap();
        // null deserializes to None for Option<Value>
        assert!(msg.result.is_none());
    }

    #[test]
    fn test_incoming_classification() {
        let response = Incoming::parse(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#).unwrap();
        assert!(matches!(response, Incoming::Response(_)));

        let request = Incoming::parse(
            r#"{"jsonrpc":"2.0","id":9,"method":"workspace/configuration","params":{}}"#,
        )
        .unwrap();
        assert!(matches!(request, Incoming::Request(_)));

        let note =
            Incoming::parse(r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{}}"#)
                .unwrap();
        assert!(matches!(note, Incoming::Notification(_)));

        let err = Incoming::parse("not json").unwrap_err();
        assert!(matches!(err, LspError::ProtocolViolation(_)));
    }

    #[test]
    fn test_error_response_with_null_id() {
        let msg = Incoming::parse(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        let Incoming::Response(response) = msg else {
            panic!("expected a response");
        };
        assert!(response.id.is_none());
        assert_eq!(response.error.unwrap().code, -32700);
    }

    #[test]
    fn test_message_without_id_or_method_is_violation() {
        let err = Incoming::parse(r#"{"jsonrpc":"2.0","result":1}"#).unwrap_err();
        assert!(matches!(err, LspError::ProtocolViolation(_)));
    }
}
