// Conduit — JSON-RPC 2.0 Envelopes
//
// One request per line in, one response per line out. Failures from the
// engine carry an application code in the -32001..-32004 range so agents can
// branch without parsing messages. Those codes also attach the
// execute-failure payload as `error.data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const VERSION: &str = "2.0";

// Codes reserved by JSON-RPC 2.0
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Required credentials could not be resolved (or no key was given).
pub const MISSING_CREDENTIALS: i32 = -32001;
/// The ability is defunct; `data.status` is 410.
pub const ABILITY_DEFUNCT: i32 = -32002;
pub const ABILITY_NOT_FOUND: i32 = -32003;
/// Template, URL, injection or transport failure inside the sandbox.
pub const SANDBOX_FAILED: i32 = -32004;

/// Incoming call. `params` defaults to `null` when omitted.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    /// Envelope checks only; params are validated by each handler.
    pub fn validate(&self) -> Result<(), String> {
        if self.jsonrpc != VERSION {
            return Err(format!("jsonrpc must be \"{}\", got \"{}\"", VERSION, self.jsonrpc));
        }
        if self.method.trim().is_empty() {
            return Err("method must not be empty".to_string());
        }
        Ok(())
    }
}

/// Outgoing reply: exactly one of `result` or `error` is present.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: VERSION,
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self::failure(id, code, message.into(), None)
    }

    /// Error with a structured payload, e.g. the defunct health summary.
    pub fn error_with_data(id: Value, code: i32, message: impl Into<String>, data: Value) -> Self {
        Self::failure(id, code, message.into(), Some(data))
    }

    /// The line was not JSON, so there is no id to echo.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::failure(Value::Null, PARSE_ERROR, message.into(), None)
    }

    fn failure(id: Value, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data,
            }),
            id,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
