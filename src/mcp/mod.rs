//! Model Context Protocol integration: server registry, protocol client,
//! and per-turn tool preparation.

pub mod client;
pub mod registry;
pub mod tools;

use client::{McpToolClient, ToolSchema};
use registry::{ServerRegistry, DEFAULT_TOOL_TIMEOUT_MS};
use std::time::Duration;

/// Lists the tool catalog of one named registry server.
///
/// Operator-facing: unlike scenario resolution, an unknown name here is an
/// error rather than an empty result, and registry parse diagnostics are
/// surfaced instead of being swallowed.
pub async fn list_server_tools(
    client: &McpToolClient,
    registry: &ServerRegistry,
    server_name: &str,
) -> Result<Vec<ToolSchema>, String> {
    if let Some(error) = registry.error() {
        return Err(error.to_string());
    }
    let server = registry
        .find(server_name)
        .ok_or_else(|| format!("MCP server not found: {server_name}"))?;
    client
        .list_tools(server, Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS))
        .await
}
