//! JSON-RPC call model shared by the dispatcher and execution policies.
//!
//! Requests arrive as canonical JSON text produced by the cell's own
//! serializer. Batch vs single form is decided by the outermost token only.

use crate::cell::CellScope;
use crate::error::DispatchError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;

/// JSON-RPC internal error code used for every recoverable call failure
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Protocol version stamped on every response
pub const JSONRPC_VERSION: &str = "2.0";

/// Caller-supplied correlation id, echoed back unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(serde_json::Number),
    String(String),
    #[default]
    Null,
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for RpcId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for RpcId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// One backend call requested by a script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub method: String,
    #[serde(default, deserialize_with = "params_from_engine")]
    pub params: Vec<JsonValue>,
    #[serde(default)]
    pub id: RpcId,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, params: Vec<JsonValue>, id: impl Into<RpcId>) -> Self {
        Self {
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

// Lua cannot tell an empty array from an empty table, so `params = {}`
// serializes as `{}`. Accept that, and null, as "no params".
fn params_from_engine<'de, D>(deserializer: D) -> Result<Vec<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::Object(map) if map.is_empty() => Ok(Vec::new()),
        other => Err(serde::de::Error::custom(format!(
            "params must be an array, got {other}"
        ))),
    }
}

/// Decoded request payload
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEnvelope {
    Single(RpcCall),
    Batch(Vec<RpcCall>),
}

impl RequestEnvelope {
    /// Classify and decode canonical payload text.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let batch = raw.trim_start().starts_with('[');
        let decoded = if batch {
            serde_json::from_str::<Vec<RpcCall>>(raw).map(Self::Batch)
        } else {
            serde_json::from_str::<RpcCall>(raw).map(Self::Single)
        };
        decoded.map_err(|err| DispatchError::MalformedRequest {
            raw: raw.to_string(),
            batch,
            reason: err.to_string(),
        })
    }

    pub const fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    /// Calls in request order
    pub fn calls(&self) -> &[RpcCall] {
        match self {
            Self::Single(call) => std::slice::from_ref(call),
            Self::Batch(calls) => calls,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Success or failure half of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(JsonValue),
    Error(RpcErrorObject),
}

/// One response object, correlated to its call by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn result(id: RpcId, result: JsonValue) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: RpcOutcome::Result(result),
        }
    }

    pub fn error(id: RpcId, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: RpcOutcome::Error(RpcErrorObject {
                code: INTERNAL_ERROR_CODE,
                message: message.into(),
            }),
        }
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Error(_))
    }
}

/// Response mirroring the request's shape
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Single(RpcResponse),
    Batch(Vec<RpcResponse>),
}

impl ResponseEnvelope {
    pub fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn responses(&self) -> &[RpcResponse] {
        match self {
            Self::Single(response) => std::slice::from_ref(response),
            Self::Batch(responses) => responses,
        }
    }
}

/// Classified failure of a single call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Encoded as a per-call error object; sibling calls still run
    #[error("{0}")]
    Recoverable(String),
    /// The caller must stop; the rest of the batch is abandoned
    #[error("{0}")]
    Fatal(String),
}

impl CallError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Performs the backend action for one call.
///
/// Implementations may block. They run while the calling cell is held, so
/// they receive the cell's scope instead of locking it again.
pub trait ExecutionPolicy: Send + Sync + 'static {
    fn execute(&self, call: &RpcCall, cell: &CellScope<'_>) -> Result<JsonValue, CallError>;
}

type MethodHandler =
    Box<dyn Fn(&RpcCall, &CellScope<'_>) -> Result<JsonValue, CallError> + Send + Sync>;

/// Policy that routes each call to a handler registered by method name.
#[derive(Default)]
pub struct MethodRouter {
    handlers: HashMap<String, MethodHandler>,
}

impl fmt::Debug for MethodRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRouter")
            .field("methods", &self.methods())
            .finish()
    }
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `method`.
    pub fn register<F>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(&RpcCall, &CellScope<'_>) -> Result<JsonValue, CallError> + Send + Sync + 'static,
    {
        self.handlers.insert(method.into(), Box::new(handler));
    }

    #[must_use]
    pub fn with_method<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&RpcCall, &CellScope<'_>) -> Result<JsonValue, CallError> + Send + Sync + 'static,
    {
        self.register(method, handler);
        self
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ExecutionPolicy for MethodRouter {
    fn execute(&self, call: &RpcCall, cell: &CellScope<'_>) -> Result<JsonValue, CallError> {
        match self.handlers.get(&call.method) {
            Some(handler) => handler(call, cell),
            None => Err(CallError::recoverable(format!(
                "the method {} does not exist/is not available",
                call.method
            ))),
        }
    }
}
