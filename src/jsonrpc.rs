//! JSON-RPC 2.0 message model.
//!
//! Every frame on the wire carries exactly one of three message kinds:
//!
//! ```text
//! Request:      {"jsonrpc":"2.0","id":1,"method":"initialize","params":{...}}
//! Notification: {"jsonrpc":"2.0","method":"initialized","params":{}}
//! Response:     {"jsonrpc":"2.0","id":1,"result":{...}}
//!               {"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"..."}}
//! ```
//!
//! Classification of an inbound value is structural: a `method` field makes
//! it a request (with `id`) or notification (without), otherwise an `id`
//! makes it a response.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Protocol version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

// =============================================================================
// Version Tag
// =============================================================================

/// The constant `"jsonrpc": "2.0"` field.
///
/// Serializes to the fixed string and refuses any other value on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag == JSONRPC_VERSION {
            Ok(Version)
        } else {
            Err(de::Error::custom(format!(
                "unsupported jsonrpc version {:?}",
                tag
            )))
        }
    }
}

// =============================================================================
// Message Types
// =============================================================================

/// Request identifier.
///
/// This client only ever issues numeric ids, but peers may use strings for
/// the requests they originate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl RequestId {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// A method call that expects a response with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Version,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A one-way method call; no response is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }
}

/// Error object returned by the peer in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    /// Interpret an arbitrary `error` payload.
    ///
    /// Well-formed error objects map field-for-field. Anything else is kept
    /// whole in `data` so nothing the peer sent is lost.
    pub fn from_payload(payload: Value) -> Self {
        match serde_json::from_value::<ResponseError>(payload.clone()) {
            Ok(err) => err,
            Err(_) => Self {
                code: error_codes::INTERNAL_ERROR,
                message: "Malformed error payload".to_string(),
                data: Some(payload),
            },
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)
    }
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(Value),
    Error(ResponseError),
}

/// Reply to a prior request, correlated by `id`.
///
/// `id` is `None` only when the peer could not determine which request it
/// is answering (it sends `"id": null`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: Version,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Version,
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn error(id: RequestId, error: ResponseError) -> Self {
        Self {
            jsonrpc: Version,
            id: Some(id),
            payload: ResponsePayload::Error(error),
        }
    }

    /// Convert into the caller-facing outcome.
    pub fn into_result(self) -> Result<Value, ResponseError> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(err) => Err(err),
        }
    }
}

/// Any message that can appear in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Classify a decoded body.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(mut object) = value else {
            return Err(de::Error::custom("message is not a JSON object"));
        };

        if object.contains_key("method") {
            return if object.contains_key("id") {
                serde_json::from_value(Value::Object(object)).map(Message::Request)
            } else {
                serde_json::from_value(Value::Object(object)).map(Message::Notification)
            };
        }

        if !object.contains_key("id") {
            return Err(de::Error::custom(
                "message has neither `method` nor `id`",
            ));
        }

        let jsonrpc: Version = take_field(&mut object, "jsonrpc")?;
        let id: Option<RequestId> = take_field(&mut object, "id")?;

        let payload = match (object.remove("error"), object.remove("result")) {
            (Some(error), _) => ResponsePayload::Error(ResponseError::from_payload(error)),
            (None, Some(result)) => ResponsePayload::Result(result),
            (None, None) => {
                return Err(de::Error::custom(
                    "response carries neither `result` nor `error`",
                ))
            }
        };

        Ok(Message::Response(Response {
            jsonrpc,
            id,
            payload,
        }))
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(note) => Some(&note.method),
            Message::Response(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(de::Error::custom)
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Notification> for Message {
    fn from(note: Notification) -> Self {
        Message::Notification(note)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

fn take_field<T: de::DeserializeOwned>(
    object: &mut Map<String, Value>,
    key: &str,
) -> Result<T, serde_json::Error> {
    serde_json::from_value(object.remove(key).unwrap_or(Value::Null))
}
