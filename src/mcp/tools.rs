//! Per-turn tool preparation: catalog fan-out, schema merge, and routing.

use crate::api::{ChatToolDefinition, ChatToolFunction};
use crate::mcp::client::{McpToolClient, ToolSchema};
use crate::mcp::registry::{McpConfig, ToolServerConfig, DEFAULT_TOOL_TIMEOUT_MS};
use futures_util::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Everything the orchestrator needs to advertise and dispatch tools for one
/// turn. An empty instance is the normal "no tools" case.
#[derive(Debug, Clone)]
pub struct PreparedTools {
    pub tools: Vec<ToolSchema>,
    pub routing: HashMap<String, ToolServerConfig>,
    pub timeout: Duration,
}

impl PreparedTools {
    pub fn empty() -> Self {
        Self {
            tools: Vec::new(),
            routing: HashMap::new(),
            timeout: Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS),
        }
    }

    /// LLM-facing tool definitions. Schemas without input parameters
    /// advertise an empty object schema.
    pub fn tool_definitions(&self) -> Vec<ChatToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool
                        .input_schema
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                },
            })
            .collect()
    }
}

/// Queries every configured server's catalog concurrently and merges the
/// results. A server whose query fails contributes nothing; the routing
/// table registers each tool name once, first server in configured order
/// wins, after which explicit `toolRouting` overrides are applied.
pub async fn prepare_tools(client: &McpToolClient, config: Option<&McpConfig>) -> PreparedTools {
    let Some(config) = config.filter(|config| !config.servers.is_empty()) else {
        return PreparedTools::empty();
    };

    let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_TOOL_TIMEOUT_MS));
    let catalogs = join_all(config.servers.iter().map(|server| async move {
        match client.list_tools(server, timeout).await {
            Ok(tools) => tools,
            Err(error) => {
                warn!(server = %server.name, %error, "tool catalog query failed");
                Vec::new()
            }
        }
    }))
    .await;

    let mut tools = Vec::new();
    let mut routing: HashMap<String, ToolServerConfig> = HashMap::new();
    for (server, catalog) in config.servers.iter().zip(catalogs) {
        for tool in catalog {
            routing
                .entry(tool.name.clone())
                .or_insert_with(|| server.clone());
            tools.push(tool);
        }
    }

    if let Some(overrides) = &config.tool_routing {
        for (tool_name, server_name) in overrides {
            // Overrides referencing unconfigured servers are silently dropped.
            if let Some(server) = config
                .servers
                .iter()
                .find(|server| &server.name == server_name)
            {
                routing.insert(tool_name.clone(), server.clone());
            }
        }
    }

    PreparedTools {
        tools,
        routing,
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(servers: Vec<ToolServerConfig>) -> McpConfig {
        McpConfig {
            servers,
            tool_routing: None,
            timeout_ms: None,
        }
    }

    fn server_named(name: &str, url: &str) -> ToolServerConfig {
        ToolServerConfig {
            name: name.to_string(),
            url: url.to_string(),
            headers: None,
            query: None,
        }
    }

    async fn catalog_server(tools: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tools": tools})))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn no_config_yields_empty_tools_and_routing() {
        let client = McpToolClient::with_client(reqwest::Client::new());
        let prepared = prepare_tools(&client, None).await;
        assert!(prepared.tools.is_empty());
        assert!(prepared.routing.is_empty());
        assert_eq!(
            prepared.timeout,
            Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS)
        );
    }

    #[tokio::test]
    async fn duplicate_tool_names_route_to_the_first_server() {
        let first = catalog_server(json!([{"name": "x"}, {"name": "only-first"}])).await;
        let second = catalog_server(json!([{"name": "x"}, {"name": "only-second"}])).await;

        let client = McpToolClient::with_client(reqwest::Client::new());
        let config = config_for(vec![
            server_named("first", &first.uri()),
            server_named("second", &second.uri()),
        ]);
        let prepared = prepare_tools(&client, Some(&config)).await;

        // Schema list keeps both advertisements; routing keeps one winner.
        assert_eq!(prepared.tools.len(), 4);
        assert_eq!(prepared.routing.get("x").map(|s| s.name.as_str()), Some("first"));
        assert_eq!(
            prepared.routing.get("only-second").map(|s| s.name.as_str()),
            Some("second")
        );
    }

    #[tokio::test]
    async fn routing_overrides_win_over_query_order() {
        let first = catalog_server(json!([{"name": "x"}])).await;
        let second = catalog_server(json!([{"name": "x"}])).await;

        let client = McpToolClient::with_client(reqwest::Client::new());
        let mut config = config_for(vec![
            server_named("first", &first.uri()),
            server_named("second", &second.uri()),
        ]);
        config.tool_routing = Some(HashMap::from([
            ("x".to_string(), "second".to_string()),
            ("y".to_string(), "unconfigured".to_string()),
        ]));
        let prepared = prepare_tools(&client, Some(&config)).await;

        assert_eq!(prepared.routing.get("x").map(|s| s.name.as_str()), Some("second"));
        assert!(!prepared.routing.contains_key("y"));
    }

    #[tokio::test]
    async fn failing_servers_contribute_nothing() {
        let healthy = catalog_server(json!([{"name": "alive"}])).await;
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&broken)
            .await;

        let client = McpToolClient::with_client(reqwest::Client::new());
        let config = config_for(vec![
            server_named("broken", &format!("{}/mcp", broken.uri())),
            server_named("healthy", &healthy.uri()),
        ]);
        let prepared = prepare_tools(&client, Some(&config)).await;

        assert_eq!(prepared.tools.len(), 1);
        assert_eq!(
            prepared.routing.get("alive").map(|s| s.name.as_str()),
            Some("healthy")
        );
    }

    #[tokio::test]
    async fn scenario_timeout_overrides_the_default() {
        let client = McpToolClient::with_client(reqwest::Client::new());
        let mut config = config_for(vec![]);
        config.timeout_ms = Some(2500);
        // Zero servers short-circuits, keeping the default timeout.
        let prepared = prepare_tools(&client, Some(&config)).await;
        assert_eq!(
            prepared.timeout,
            Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS)
        );

        let catalog = catalog_server(json!([])).await;
        config.servers = vec![server_named("alpha", &catalog.uri())];
        let prepared = prepare_tools(&client, Some(&config)).await;
        assert_eq!(prepared.timeout, Duration::from_millis(2500));
    }
}
