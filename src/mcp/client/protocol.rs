//! Minimal JSON-RPC 2.0 message surface for the tool protocol.
//!
//! Only the request shapes the client actually sends are modeled; responses
//! keep their `result` as a raw value so both protocol variants can share the
//! same parsing path.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const MCP_PROTOCOL_VERSION: &str = "2025-11-25";

const JSONRPC_VERSION: &str = "2.0";
const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const INITIALIZE_REQUEST_ID: i64 = 1;
const LIST_TOOLS_REQUEST_ID: i64 = 2;
const CALL_TOOL_REQUEST_ID: i64 = 3;

/// A remote tool as advertised by a server catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

pub fn initialize_request() -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION,
        id: Some(INITIALIZE_REQUEST_ID),
        method: "initialize",
        params: Some(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": CLIENT_VERSION,
            },
        })),
    }
}

pub fn initialized_notification() -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION,
        id: None,
        method: "initialized",
        params: Some(json!({})),
    }
}

pub fn list_tools_request() -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION,
        id: Some(LIST_TOOLS_REQUEST_ID),
        method: "tools/list",
        params: Some(json!({})),
    }
}

pub fn call_tool_request(tool_name: &str, arguments: Map<String, Value>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION,
        id: Some(CALL_TOOL_REQUEST_ID),
        method: "tools/call",
        params: Some(json!({
            "name": tool_name,
            "arguments": Value::Object(arguments),
        })),
    }
}

/// Surfaces a JSON-RPC `error` as the call error, otherwise hands back the
/// raw `result` payload (`{}` when the server omitted one).
pub fn expect_result(response: JsonRpcResponse) -> Result<Value, String> {
    if let Some(error) = response.error {
        if error.message.is_empty() {
            return Err(format!("JSON-RPC error {}", error.code));
        }
        return Err(error.message);
    }
    Ok(response.result.unwrap_or_else(|| json!({})))
}

/// Extracts the tool catalog from a `tools/list` result. Entries that fail to
/// deserialize are skipped rather than failing the whole catalog.
pub fn tools_from_result(result: &Value) -> Vec<ToolSchema> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
