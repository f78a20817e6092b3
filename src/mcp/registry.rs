//! Tool-server registry and scenario config normalization.
//!
//! The registry is parsed once from the environment-derived JSON document and
//! is read-only afterwards. Scenario configs reference it by server name or
//! embed server entries directly; [`McpConfig::from_scenario`] folds the four
//! accepted shapes into one normalized form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default per-call timeout for tool-server traffic.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 8000;

const ERR_NOT_JSON: &str = "MCP_SERVER_REGISTRY 不是合法 JSON";
const ERR_NOT_ARRAY: &str = "MCP_SERVER_REGISTRY 必须是 JSON 数组";
const ERR_NO_VALID_ENTRIES: &str = "MCP_SERVER_REGISTRY 中未解析到有效的 name/url";

/// A single remote tool server. Immutable once resolved for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<HashMap<String, String>>,
}

fn string_map(value: Option<&Value>) -> Option<HashMap<String, String>> {
    let object = value?.as_object()?;
    let map: HashMap<String, String> = object
        .iter()
        .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_string())))
        .collect();
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Parses one registry/scenario server entry, dropping entries without a
/// non-empty name and url.
fn parse_server_entry(value: &Value) -> Option<ToolServerConfig> {
    let object = value.as_object()?;
    let name = object.get("name")?.as_str()?.trim();
    let url = object.get("url")?.as_str()?.trim();
    if name.is_empty() || url.is_empty() {
        return None;
    }
    Some(ToolServerConfig {
        name: name.to_string(),
        url: url.to_string(),
        headers: string_map(object.get("headers")),
        query: string_map(object.get("query")),
    })
}

/// The process-wide tool-server registry plus its parse diagnostic.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Vec<ToolServerConfig>,
    error: Option<String>,
}

impl ServerRegistry {
    /// Builds the registry from the raw environment value. A missing value is
    /// an empty registry without diagnostic; malformed input keeps the
    /// registry empty and records an operator-facing message.
    pub fn from_raw(raw: Option<&str>) -> Self {
        let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
            return Self::default();
        };

        let parsed: Value = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Self {
                    servers: Vec::new(),
                    error: Some(ERR_NOT_JSON.to_string()),
                }
            }
        };

        let Some(entries) = parsed.as_array() else {
            return Self {
                servers: Vec::new(),
                error: Some(ERR_NOT_ARRAY.to_string()),
            };
        };

        let servers: Vec<ToolServerConfig> =
            entries.iter().filter_map(parse_server_entry).collect();
        if servers.is_empty() {
            return Self {
                servers,
                error: Some(ERR_NO_VALID_ENTRIES.to_string()),
            };
        }

        Self {
            servers,
            error: None,
        }
    }

    pub fn servers(&self) -> &[ToolServerConfig] {
        &self.servers
    }

    /// Parse diagnostic for operator surfaces; `None` when the registry
    /// loaded cleanly (or was simply absent).
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn find(&self, name: &str) -> Option<&ToolServerConfig> {
        self.servers.iter().find(|server| server.name == name)
    }

    /// Resolves a name subset, preserving registry order. Unknown names
    /// silently yield no server; `None` returns the whole registry.
    pub fn resolve(&self, names: Option<&[String]>) -> Vec<ToolServerConfig> {
        match names {
            None => self.servers.clone(),
            Some(names) if names.is_empty() => self.servers.clone(),
            Some(names) => self
                .servers
                .iter()
                .filter(|server| names.iter().any(|name| name == &server.name))
                .cloned()
                .collect(),
        }
    }
}

/// Normalized scenario tool configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct McpConfig {
    pub servers: Vec<ToolServerConfig>,
    pub tool_routing: Option<HashMap<String, String>>,
    pub timeout_ms: Option<u64>,
}

impl McpConfig {
    /// Normalizes a scenario's free-form `config` object.
    ///
    /// Server resolution order: `servers` > `serverNames` > `mcp.servers` >
    /// `mcp.serverNames`; the first shape present wins. Returns `None` when
    /// no shape is present or a names-based shape resolves to zero registry
    /// servers. `toolRouting` and `timeoutMs` read nested-first, matching
    /// how the admin form round-trips them.
    pub fn from_scenario(config: Option<&Value>, registry: &ServerRegistry) -> Option<Self> {
        let object = config?.as_object()?;
        let mcp = object.get("mcp").and_then(Value::as_object);

        let servers = if let Some(entries) = object.get("servers").and_then(Value::as_array) {
            entries.iter().filter_map(parse_server_entry).collect()
        } else if let Some(names) = string_list(object.get("serverNames")) {
            let resolved = registry.resolve(Some(&names));
            if resolved.is_empty() {
                return None;
            }
            resolved
        } else if let Some(entries) = mcp
            .and_then(|mcp| mcp.get("servers"))
            .and_then(Value::as_array)
        {
            entries.iter().filter_map(parse_server_entry).collect()
        } else if let Some(names) = string_list(mcp.and_then(|mcp| mcp.get("serverNames"))) {
            let resolved = registry.resolve(Some(&names));
            if resolved.is_empty() {
                return None;
            }
            resolved
        } else {
            return None;
        };

        let tool_routing = string_map(mcp.and_then(|mcp| mcp.get("toolRouting")))
            .or_else(|| string_map(object.get("toolRouting")));
        let timeout_ms = positive_millis(mcp.and_then(|mcp| mcp.get("timeoutMs")))
            .or_else(|| positive_millis(object.get("timeoutMs")));

        Some(Self {
            servers,
            tool_routing,
            timeout_ms,
        })
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let entries = value?.as_array()?;
    Some(
        entries
            .iter()
            .filter_map(|entry| entry.as_str().map(str::to_string))
            .collect(),
    )
}

fn positive_millis(value: Option<&Value>) -> Option<u64> {
    let millis = value?.as_f64()?;
    if millis > 0.0 {
        Some(millis.round() as u64)
    } else {
        None
    }
}
