//! Tool protocol client.
//!
//! Two protocol variants sit behind one interface: a legacy plain-HTTP
//! variant (`POST {url}/tools/list` / `POST {url}/tools/call`) and a
//! streamable JSON-RPC variant that performs an initialize/initialized
//! handshake per top-level call. Servers whose URL ends in an `/mcp` segment
//! speak the streamable variant directly; every other server is addressed
//! through a fallback decorator that retries a failed legacy call once
//! against the derived `/mcp` URL.

use crate::mcp::registry::ToolServerConfig;
use crate::utils::url::{construct_api_url, normalize_base_url, streamable_fallback_url};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

mod protocol;
mod transport;

pub use protocol::ToolSchema;

use protocol::{
    call_tool_request, expect_result, initialize_request, initialized_notification,
    list_tools_request, tools_from_result,
};
use transport::{apply_server_decorations, non_empty_or, request_error, send_rpc};

const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

fn build_mcp_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| err.to_string())
}

#[async_trait]
trait ToolTransport: Send + Sync {
    async fn list_tools(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Vec<ToolSchema>, String>;

    async fn call_tool(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, String>;
}

struct LegacyHttpTransport;

#[async_trait]
impl ToolTransport for LegacyHttpTransport {
    async fn list_tools(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Vec<ToolSchema>, String> {
        let url = construct_api_url(&server.url, "tools/list");
        let response = apply_server_decorations(http.post(url), server)
            .timeout(timeout)
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| request_error(err, timeout))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(non_empty_or(text, "MCP tools/list failed"));
        }

        let data = response
            .json::<Value>()
            .await
            .map_err(|err| err.to_string())?;
        Ok(tools_from_result(&data))
    }

    async fn call_tool(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, String> {
        let url = construct_api_url(&server.url, "tools/call");
        let response = apply_server_decorations(http.post(url), server)
            .timeout(timeout)
            .json(&json!({"name": tool_name, "arguments": Value::Object(arguments)}))
            .send()
            .await
            .map_err(|err| request_error(err, timeout))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(non_empty_or(text, "MCP tool call failed"));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| err.to_string())
    }
}

struct StreamableHttpTransport;

impl StreamableHttpTransport {
    /// Runs the per-call handshake: `initialize` (capturing the session id
    /// from response headers), then the `initialized` notification. Sessions
    /// are not cached across top-level calls.
    async fn ensure_session(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Option<String>, String> {
        let init = send_rpc(http, server, &initialize_request(), timeout, None).await?;
        if let Some(response) = &init.response {
            if let Some(error) = &response.error {
                return Err(error.message.clone());
            }
        }
        let session_id = init.session_id;

        send_rpc(
            http,
            server,
            &initialized_notification(),
            timeout,
            session_id.as_deref(),
        )
        .await?;
        Ok(session_id)
    }

    async fn request(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        message: &protocol::JsonRpcRequest,
        timeout: Duration,
    ) -> Result<Value, String> {
        let session_id = self.ensure_session(http, server, timeout).await?;
        let exchange = send_rpc(http, server, message, timeout, session_id.as_deref()).await?;
        let response = exchange
            .response
            .ok_or_else(|| "MCP response missing payload".to_string())?;
        expect_result(response)
    }
}

#[async_trait]
impl ToolTransport for StreamableHttpTransport {
    async fn list_tools(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Vec<ToolSchema>, String> {
        let result = self
            .request(http, server, &list_tools_request(), timeout)
            .await?;
        Ok(tools_from_result(&result))
    }

    async fn call_tool(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, String> {
        self.request(http, server, &call_tool_request(tool_name, arguments), timeout)
            .await
    }
}

/// Decorator for legacy servers: on any legacy failure, retry once via the
/// streamable variant at the derived `/mcp` URL before giving up.
struct LegacyFallbackTransport;

fn fallback_server(server: &ToolServerConfig) -> Option<ToolServerConfig> {
    let fallback_url = streamable_fallback_url(&server.url);
    if fallback_url == normalize_base_url(&server.url) {
        return None;
    }
    Some(ToolServerConfig {
        url: fallback_url,
        ..server.clone()
    })
}

#[async_trait]
impl ToolTransport for LegacyFallbackTransport {
    async fn list_tools(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Vec<ToolSchema>, String> {
        match LegacyHttpTransport.list_tools(http, server, timeout).await {
            Ok(tools) => Ok(tools),
            Err(original) => {
                let Some(fallback) = fallback_server(server) else {
                    return Err(original);
                };
                debug!(server = %server.name, url = %fallback.url, "legacy tools/list failed, retrying streamable fallback");
                StreamableHttpTransport
                    .list_tools(http, &fallback, timeout)
                    .await
            }
        }
    }

    async fn call_tool(
        &self,
        http: &reqwest::Client,
        server: &ToolServerConfig,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, String> {
        match LegacyHttpTransport
            .call_tool(http, server, tool_name, arguments.clone(), timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(original) => {
                let Some(fallback) = fallback_server(server) else {
                    return Err(original);
                };
                debug!(server = %server.name, tool = tool_name, url = %fallback.url, "legacy tools/call failed, retrying streamable fallback");
                StreamableHttpTransport
                    .call_tool(http, &fallback, tool_name, arguments, timeout)
                    .await
            }
        }
    }
}

fn transport_for(server: &ToolServerConfig) -> &'static dyn ToolTransport {
    if crate::utils::url::is_streamable_endpoint(&server.url) {
        &StreamableHttpTransport
    } else {
        &LegacyFallbackTransport
    }
}

/// Protocol-variant-agnostic tool client shared across a turn.
#[derive(Clone)]
pub struct McpToolClient {
    http: reqwest::Client,
}

impl McpToolClient {
    pub fn new() -> Result<Self, String> {
        Ok(Self {
            http: build_mcp_http_client()?,
        })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn list_tools(
        &self,
        server: &ToolServerConfig,
        timeout: Duration,
    ) -> Result<Vec<ToolSchema>, String> {
        transport_for(server)
            .list_tools(&self.http, server, timeout)
            .await
    }

    pub async fn call_tool(
        &self,
        server: &ToolServerConfig,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, String> {
        transport_for(server)
            .call_tool(&self.http, server, tool_name, arguments, timeout)
            .await
    }
}
