//! Single timed JSON-RPC exchange against a tool server.
//!
//! Responses arrive either as one JSON document or as an event stream; the
//! stream is scanned frame-by-frame until a JSON-RPC payload matching the
//! request id shows up. Session ids surfaced via response headers are threaded
//! back to the caller for reuse within the same top-level operation.

use super::protocol::{JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
use crate::mcp::registry::ToolServerConfig;
use futures_util::StreamExt;
use std::time::Duration;

pub(crate) const MCP_SESSION_ID_HEADER: &str = "MCP-Session-Id";
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";

#[derive(Debug)]
pub(crate) struct RpcExchange {
    /// `None` for notifications, which carry no content reply.
    pub response: Option<JsonRpcResponse>,
    pub session_id: Option<String>,
}

/// Applies a server's configured query parameters and extra headers.
pub(crate) fn apply_server_decorations(
    mut request: reqwest::RequestBuilder,
    server: &ToolServerConfig,
) -> reqwest::RequestBuilder {
    if let Some(query) = &server.query {
        request = request.query(query);
    }
    if let Some(headers) = &server.headers {
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
    }
    request
}

pub(crate) fn request_error(err: reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        format!("MCP request timed out after {}ms", timeout.as_millis())
    } else {
        err.to_string()
    }
}

fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub(crate) async fn send_rpc(
    http: &reqwest::Client,
    server: &ToolServerConfig,
    message: &JsonRpcRequest,
    timeout: Duration,
    session_id: Option<&str>,
) -> Result<RpcExchange, String> {
    let mut request = apply_server_decorations(http.post(&server.url), server)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
        .header(MCP_PROTOCOL_VERSION_HEADER, MCP_PROTOCOL_VERSION)
        .timeout(timeout)
        .json(message);
    if let Some(session_id) = session_id {
        request = request.header(MCP_SESSION_ID_HEADER, session_id);
    }

    let response = request
        .send()
        .await
        .map_err(|err| request_error(err, timeout))?;

    let session_header = response
        .headers()
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let returned_session = session_header.or_else(|| session_id.map(str::to_string));
    let status = response.status();

    if message.id.is_none() {
        if !status.is_success() && status.as_u16() != 202 {
            let text = response.text().await.unwrap_or_default();
            return Err(non_empty_or(text, "MCP notification failed"));
        }
        return Ok(RpcExchange {
            response: None,
            session_id: returned_session,
        });
    }

    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(non_empty_or(
            text,
            &format!("MCP request failed ({})", status.as_u16()),
        ));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let payload = if is_event_stream_content_type(&content_type) {
        read_jsonrpc_from_sse(response, message.id, timeout).await?
    } else {
        let body = response
            .bytes()
            .await
            .map_err(|err| request_error(err, timeout))?;
        serde_json::from_slice::<JsonRpcResponse>(&body).map_err(|err| err.to_string())?
    };

    Ok(RpcExchange {
        response: Some(payload),
        session_id: returned_session,
    })
}

pub(crate) fn non_empty_or(text: String, fallback: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Accumulates raw bytes and yields complete event payloads: the `data:`
/// lines of each blank-line-separated event, joined.
#[derive(Default)]
pub(crate) struct SseEventBuffer {
    buffer: Vec<u8>,
}

impl SseEventBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_events(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_events(true)
    }

    fn drain_events(&mut self, flush: bool) -> Vec<String> {
        let mut payloads = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..]
            .windows(2)
            .position(|window| window == b"\n\n")
        {
            let event_end = search_index + relative_pos;
            let event = String::from_utf8_lossy(&self.buffer[search_index..event_end]);
            if let Some(payload) = event_data_payload(&event) {
                payloads.push(payload);
            }
            search_index = event_end + 2;
        }

        if flush {
            let event = String::from_utf8_lossy(&self.buffer[search_index..]);
            if let Some(payload) = event_data_payload(&event) {
                payloads.push(payload);
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        payloads
    }
}

fn event_data_payload(event: &str) -> Option<String> {
    let data_lines: Vec<&str> = event
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data_lines.is_empty() {
        return None;
    }
    let payload = data_lines.join("\n").trim().to_string();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

fn decode_frame(payload: &str, expected_id: Option<i64>) -> Option<JsonRpcResponse> {
    let message = serde_json::from_str::<JsonRpcResponse>(payload).ok()?;
    match expected_id {
        None => Some(message),
        Some(id) if message.id == Some(id) => Some(message),
        _ => None,
    }
}

async fn read_jsonrpc_from_sse(
    response: reqwest::Response,
    expected_id: Option<i64>,
    timeout: Duration,
) -> Result<JsonRpcResponse, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseEventBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| request_error(err, timeout))?;
        for payload in buffer.push(&chunk) {
            if let Some(message) = decode_frame(&payload, expected_id) {
                return Ok(message);
            }
        }
    }

    for payload in buffer.finish() {
        if let Some(message) = decode_frame(&payload, expected_id) {
            return Ok(message);
        }
    }

    Err("SSE response missing JSON-RPC payload".to_string())
}
