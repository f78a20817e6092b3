//! The chat-turn state machine.
//!
//! One turn runs: prompt resolution, tool preparation, a first completion,
//! one optional round of sequential tool dispatch, a second completion,
//! persistence, and trace submission. At most one follow-up completion runs
//! regardless of how many tool calls the model requests; the pipeline does
//! not chain further rounds.

use super::{
    ChatTurnError, ChatTurnOutcome, ChatTurnRequest, MessageStore, ScenarioStore, StoredMessage,
};
use crate::api::completions::create_chat_completion;
use crate::api::{ChatMessage, ChatToolCall};
use crate::core::config::PipelineConfig;
use crate::mcp::client::McpToolClient;
use crate::mcp::registry::McpConfig;
use crate::mcp::tools::{prepare_tools, PreparedTools};
use crate::prompt::{interpolate, prompt_variables, resolve_prompt};
use crate::trace::{ChatTrace, GenerationRecord, ToolSpanRecord, TraceReporter};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;

fn build_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
        .build()
        .map_err(|err| err.to_string())
}

pub struct ChatPipeline {
    config: PipelineConfig,
    http: reqwest::Client,
    mcp: McpToolClient,
    reporter: TraceReporter,
    scenarios: Arc<dyn ScenarioStore>,
    messages: Arc<dyn MessageStore>,
}

impl ChatPipeline {
    pub fn new(
        config: PipelineConfig,
        scenarios: Arc<dyn ScenarioStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Result<Self, String> {
        let http = build_http_client()?;
        let mcp = McpToolClient::new()?;
        let reporter = TraceReporter::new(http.clone(), config.langfuse.clone());
        Ok(Self {
            config,
            http,
            mcp,
            reporter,
            scenarios,
            messages,
        })
    }

    pub async fn handle_turn(
        &self,
        request: ChatTurnRequest,
    ) -> Result<ChatTurnOutcome, ChatTurnError> {
        request.validate()?;

        let scenario = self
            .scenarios
            .fetch_scenario(&request.scenario_id)
            .await
            .map_err(ChatTurnError::ScenarioLookup)?
            .ok_or_else(|| ChatTurnError::ScenarioNotFound(request.scenario_id.clone()))?;

        let resolved = resolve_prompt(
            &self.http,
            self.config.langfuse.as_ref(),
            &scenario.prompt_key,
        )
        .await;
        let variables = prompt_variables(resolved.config.as_ref(), scenario.config.as_ref());
        let system_prompt = interpolate(&resolved.prompt, &variables);

        let mcp_config = McpConfig::from_scenario(scenario.config.as_ref(), &self.config.registry);
        let prepared = prepare_tools(&self.mcp, mcp_config.as_ref()).await;
        let definitions = prepared.tool_definitions();
        let tool_definitions =
            (!definitions.is_empty()).then_some(definitions.as_slice());

        let mut conversation = Vec::with_capacity(request.messages.len() + 1);
        conversation.push(ChatMessage::system(system_prompt));
        conversation.extend(request.messages.iter().cloned());

        let metadata = json!({
            "scenarioId": request.scenario_id,
            "conversationId": request.conversation_id,
            "config": resolved
                .config
                .clone()
                .or_else(|| scenario.config.clone())
                .unwrap_or(Value::Null),
        });
        let mut trace = ChatTrace::new(
            scenario.prompt_key.clone(),
            request.user_id.clone(),
            metadata,
        );
        trace.input = trace_messages(&conversation);

        let started = Utc::now();
        let first = create_chat_completion(
            &self.http,
            &self.config.openai,
            &conversation,
            tool_definitions,
        )
        .await
        .map_err(ChatTurnError::Completion)?;
        trace.generations.push(GenerationRecord::new(
            format!("{} #1", scenario.prompt_key),
            self.config.openai.model.clone(),
            trace_messages(&conversation),
            first.content.clone(),
            first.usage.clone(),
            started,
        ));

        let reply = if first.tool_calls.is_empty() {
            first.content
        } else {
            debug!(
                count = first.tool_calls.len(),
                scenario = %request.scenario_id,
                "dispatching tool calls"
            );
            conversation.push(ChatMessage::assistant_with_tool_calls(
                first.content,
                first.tool_calls.clone(),
            ));
            let (tool_messages, spans) = self
                .dispatch_tool_calls(&prepared, &first.tool_calls)
                .await;
            conversation.extend(tool_messages);
            trace.spans.extend(spans);

            let started = Utc::now();
            let second = create_chat_completion(
                &self.http,
                &self.config.openai,
                &conversation,
                tool_definitions,
            )
            .await
            .map_err(ChatTurnError::Completion)?;
            trace.generations.push(GenerationRecord::new(
                format!("{} #2", scenario.prompt_key),
                self.config.openai.model.clone(),
                trace_messages(&conversation),
                second.content.clone(),
                second.usage.clone(),
                started,
            ));
            second.content
        };

        if let Some(user_id) = &request.user_id {
            let last_user_message = request
                .messages
                .last()
                .map(|message| message.content.clone())
                .unwrap_or_default();
            let rows = [
                StoredMessage {
                    user_id: user_id.clone(),
                    scenario_id: request.scenario_id.clone(),
                    conversation_id: request.conversation_id.clone(),
                    role: "user".to_string(),
                    content: last_user_message,
                },
                StoredMessage {
                    user_id: user_id.clone(),
                    scenario_id: request.scenario_id.clone(),
                    conversation_id: request.conversation_id.clone(),
                    role: "assistant".to_string(),
                    content: reply.clone(),
                },
            ];
            self.messages
                .append_messages(&rows)
                .await
                .map_err(ChatTurnError::Persistence)?;
        }

        trace.output = reply.clone();
        let trace_warning = match self.reporter.submit(&trace).await {
            Ok(()) => None,
            Err(error) => {
                warn!(%error, "trace submission failed");
                Some(error)
            }
        };

        Ok(ChatTurnOutcome {
            reply,
            trace_warning,
        })
    }

    /// Dispatches one round of tool calls sequentially, in the order the
    /// model requested them, so trace ordering stays deterministic. Failures
    /// fold into the conversation instead of aborting the turn.
    async fn dispatch_tool_calls(
        &self,
        prepared: &PreparedTools,
        tool_calls: &[ChatToolCall],
    ) -> (Vec<ChatMessage>, Vec<ToolSpanRecord>) {
        let mut messages = Vec::with_capacity(tool_calls.len());
        let mut spans = Vec::new();

        for call in tool_calls {
            let tool_name = &call.function.name;
            let Some(server) = prepared.routing.get(tool_name) else {
                messages.push(ChatMessage::tool(
                    call.id.clone(),
                    format!("Tool not routed: {tool_name}"),
                ));
                continue;
            };

            let arguments = parse_tool_arguments(&call.function.arguments);
            let span_input = json!({
                "tool": tool_name,
                "server": server.name,
                "arguments": Value::Object(arguments.clone()),
            });
            let started = Utc::now();
            match self
                .mcp
                .call_tool(server, tool_name, arguments, prepared.timeout)
                .await
            {
                Ok(result) => {
                    messages.push(ChatMessage::tool(call.id.clone(), result.to_string()));
                    spans.push(ToolSpanRecord::success(
                        tool_name.clone(),
                        span_input,
                        result,
                        started,
                    ));
                }
                Err(error) => {
                    warn!(tool = %tool_name, server = %server.name, %error, "tool call failed");
                    messages.push(ChatMessage::tool(call.id.clone(), error.clone()));
                    spans.push(ToolSpanRecord::failure(
                        tool_name.clone(),
                        span_input,
                        error,
                        started,
                    ));
                }
            }
        }

        (messages, spans)
    }
}

/// Lenient tool-call argument parsing: anything that is not a JSON object
/// becomes an empty argument object, and the call proceeds.
fn parse_tool_arguments(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Projects messages into the trace representation. The trace schema has no
/// tool role, so tool results are downgraded to assistant turns.
fn trace_messages(messages: &[ChatMessage]) -> Value {
    Value::Array(
        messages
            .iter()
            .map(|message| {
                let role = if message.role == "tool" {
                    "assistant"
                } else {
                    message.role.as_str()
                };
                json!({"role": role, "content": message.content})
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{InMemoryMessageStore, InMemoryScenarioStore, Scenario};
    use crate::core::config::{LangfuseConfig, OpenAiConfig};
    use crate::mcp::registry::ServerRegistry;
    use crate::trace::TRACE_SKIPPED_NOT_CONFIGURED;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn tool_arguments_parse_leniently() {
        assert!(parse_tool_arguments("").is_empty());
        assert!(parse_tool_arguments("{invalid json").is_empty());
        assert!(parse_tool_arguments("[1, 2]").is_empty());
        let parsed = parse_tool_arguments("{\"q\": \"rust\"}");
        assert_eq!(parsed.get("q"), Some(&json!("rust")));
    }

    #[test]
    fn tool_roles_downgrade_to_assistant_in_traces() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::tool("call-1", "result"),
        ];
        let projected = trace_messages(&messages);
        assert_eq!(projected[0]["role"], "user");
        assert_eq!(projected[1]["role"], "assistant");
        assert_eq!(projected[1]["content"], "result");
    }

    fn pipeline_for(
        openai: &MockServer,
        langfuse: Option<LangfuseConfig>,
        scenarios: InMemoryScenarioStore,
        messages: Arc<InMemoryMessageStore>,
    ) -> ChatPipeline {
        let config = PipelineConfig {
            registry: ServerRegistry::from_raw(None),
            langfuse,
            prompt_options: Vec::new(),
            openai: OpenAiConfig {
                api_key: Some("test-key".to_string()),
                base_url: openai.uri(),
                model: "gpt-4o-mini".to_string(),
                timeout_ms: Some(2000),
            },
        };
        ChatPipeline::new(config, Arc::new(scenarios), messages).expect("pipeline")
    }

    fn turn_request(user_id: Option<&str>) -> ChatTurnRequest {
        ChatTurnRequest {
            scenario_id: "s-1".to_string(),
            conversation_id: "c-1".to_string(),
            user_id: user_id.map(str::to_string),
            messages: vec![ChatMessage::user("what's new?")],
        }
    }

    fn scenario_without_tools() -> Scenario {
        Scenario {
            id: "s-1".to_string(),
            prompt_key: "daily-brief".to_string(),
            config: None,
        }
    }

    async fn mount_completion_once(server: &MockServer, body: Value) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .up_to_n_times(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn rejects_incomplete_requests_before_any_network_call() {
        let openai = MockServer::start().await;
        let pipeline = pipeline_for(
            &openai,
            None,
            InMemoryScenarioStore::default(),
            Arc::new(InMemoryMessageStore::default()),
        );
        let err = pipeline
            .handle_turn(ChatTurnRequest::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, ChatTurnError::MissingFields));
        assert!(openai.received_requests().await.expect("requests").is_empty());
    }

    #[tokio::test]
    async fn unknown_scenarios_are_fatal() {
        let openai = MockServer::start().await;
        let pipeline = pipeline_for(
            &openai,
            None,
            InMemoryScenarioStore::default(),
            Arc::new(InMemoryMessageStore::default()),
        );
        let err = pipeline
            .handle_turn(turn_request(None))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ChatTurnError::ScenarioNotFound(id) if id == "s-1"));
    }

    #[tokio::test]
    async fn zero_tool_calls_answer_in_one_generation() {
        let openai = MockServer::start().await;
        mount_completion_once(
            &openai,
            json!({"choices": [{"message": {"content": "all quiet"}}]}),
        )
        .await;

        let store = Arc::new(InMemoryMessageStore::default());
        let pipeline = pipeline_for(
            &openai,
            None,
            InMemoryScenarioStore::with_scenarios([scenario_without_tools()]),
            store.clone(),
        );
        let outcome = pipeline
            .handle_turn(turn_request(None))
            .await
            .expect("turn");

        assert_eq!(outcome.reply, "all quiet");
        // Trace sink unset: the skip is reported as a soft warning.
        assert_eq!(
            outcome.trace_warning.as_deref(),
            Some(TRACE_SKIPPED_NOT_CONFIGURED)
        );
        // Guest turn: nothing persisted.
        assert!(store.messages().await.is_empty());

        let requests = openai.received_requests().await.expect("requests");
        assert_eq!(requests.len(), 1);
        let body: Value = serde_json::from_slice(&requests[0].body).expect("json");
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "daily-brief");
    }

    #[tokio::test]
    async fn tool_round_produces_two_generations_and_one_span() {
        let tool_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"tools": [{"name": "lookup", "description": "find things"}]}),
            ))
            .mount(&tool_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tools/call"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"answer": "rust 1.83"})),
            )
            .mount(&tool_server)
            .await;

        let openai = MockServer::start().await;
        mount_completion_once(
            &openai,
            json!({"choices": [{"message": {
                "content": null,
                "tool_calls": [
                    {"id": "call-1", "type": "function",
                     "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}},
                    {"id": "call-2", "type": "function",
                     "function": {"name": "ghost", "arguments": "{}"}},
                ],
            }}]}),
        )
        .await;
        mount_completion_once(
            &openai,
            json!({"choices": [{"message": {"content": "final answer"}}]}),
        )
        .await;

        let langfuse = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/public/ingestion"))
            .respond_with(ResponseTemplate::new(207).set_body_json(json!({"errors": []})))
            .mount(&langfuse)
            .await;

        let scenario = Scenario {
            id: "s-1".to_string(),
            prompt_key: "daily-brief".to_string(),
            config: Some(json!({
                "servers": [{"name": "local", "url": tool_server.uri()}],
            })),
        };
        let langfuse_config = LangfuseConfig {
            host: langfuse.uri(),
            public_key: "pk".to_string(),
            secret_key: "sk".to_string(),
        };
        let store = Arc::new(InMemoryMessageStore::default());
        let pipeline = pipeline_for(
            &openai,
            Some(langfuse_config),
            InMemoryScenarioStore::with_scenarios([scenario]),
            store.clone(),
        );
        let outcome = pipeline
            .handle_turn(turn_request(Some("user-1")))
            .await
            .expect("turn");

        assert_eq!(outcome.reply, "final answer");
        assert!(outcome.trace_warning.is_none());

        // The second completion sees the tool results, including the
        // synthetic message for the unrouted call.
        let completion_requests = openai.received_requests().await.expect("requests");
        assert_eq!(completion_requests.len(), 2);
        let second: Value = serde_json::from_slice(&completion_requests[1].body).expect("json");
        let messages = second["messages"].as_array().expect("messages");
        let tool_contents: Vec<&str> = messages
            .iter()
            .filter(|message| message["role"] == "tool")
            .map(|message| message["content"].as_str().unwrap_or(""))
            .collect();
        assert_eq!(
            tool_contents,
            vec!["{\"answer\":\"rust 1.83\"}", "Tool not routed: ghost"]
        );

        // Exactly two generations and one span (the routed call only).
        let trace_requests = langfuse.received_requests().await.expect("requests");
        assert_eq!(trace_requests.len(), 1);
        let batch: Value = serde_json::from_slice(&trace_requests[0].body).expect("json");
        let types: Vec<&str> = batch["batch"]
            .as_array()
            .expect("batch")
            .iter()
            .map(|event| event["type"].as_str().unwrap_or(""))
            .collect();
        assert_eq!(
            types,
            vec![
                "trace-create",
                "generation-create",
                "generation-create",
                "span-create",
            ]
        );

        // Both turn rows persisted for the authenticated caller.
        let rows = store.messages().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, "user");
        assert_eq!(rows[0].content, "what's new?");
        assert_eq!(rows[1].role, "assistant");
        assert_eq!(rows[1].content, "final answer");
    }

    #[tokio::test]
    async fn invalid_tool_arguments_default_to_an_empty_object() {
        let tool_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/list"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"tools": [{"name": "lookup"}]})),
            )
            .mount(&tool_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tools/call"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&tool_server)
            .await;

        let openai = MockServer::start().await;
        mount_completion_once(
            &openai,
            json!({"choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "call-1", "type": "function",
                    "function": {"name": "lookup", "arguments": "{invalid json"}}],
            }}]}),
        )
        .await;
        mount_completion_once(
            &openai,
            json!({"choices": [{"message": {"content": "done"}}]}),
        )
        .await;

        let scenario = Scenario {
            id: "s-1".to_string(),
            prompt_key: "daily-brief".to_string(),
            config: Some(json!({
                "servers": [{"name": "local", "url": tool_server.uri()}],
            })),
        };
        let pipeline = pipeline_for(
            &openai,
            None,
            InMemoryScenarioStore::with_scenarios([scenario]),
            Arc::new(InMemoryMessageStore::default()),
        );
        let outcome = pipeline
            .handle_turn(turn_request(None))
            .await
            .expect("turn");
        assert_eq!(outcome.reply, "done");

        let calls = tool_server.received_requests().await.expect("requests");
        let call_body: Value = serde_json::from_slice(
            &calls
                .iter()
                .find(|request| request.url.path() == "/tools/call")
                .expect("tool call")
                .body,
        )
        .expect("json");
        assert_eq!(call_body["arguments"], json!({}));
    }

    #[tokio::test]
    async fn tool_failures_fold_into_the_conversation() {
        let tool_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&tool_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tools/list"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"tools": [{"name": "lookup"}]})),
            )
            .mount(&tool_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tools/call"))
            .respond_with(ResponseTemplate::new(500).set_body_string("tool exploded"))
            .mount(&tool_server)
            .await;

        let openai = MockServer::start().await;
        mount_completion_once(
            &openai,
            json!({"choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "call-1", "type": "function",
                    "function": {"name": "lookup", "arguments": "{}"}}],
            }}]}),
        )
        .await;
        mount_completion_once(
            &openai,
            json!({"choices": [{"message": {"content": "recovered"}}]}),
        )
        .await;

        let scenario = Scenario {
            id: "s-1".to_string(),
            prompt_key: "daily-brief".to_string(),
            config: Some(json!({
                "servers": [{"name": "local", "url": tool_server.uri()}],
            })),
        };
        let pipeline = pipeline_for(
            &openai,
            None,
            InMemoryScenarioStore::with_scenarios([scenario]),
            Arc::new(InMemoryMessageStore::default()),
        );
        let outcome = pipeline
            .handle_turn(turn_request(None))
            .await
            .expect("turn");

        // The turn completes; the model sees the failure text.
        assert_eq!(outcome.reply, "recovered");
        let requests = openai.received_requests().await.expect("requests");
        let second: Value = serde_json::from_slice(&requests[1].body).expect("json");
        let tool_message = second["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .find(|message| message["role"] == "tool")
            .expect("tool message")
            .clone();
        assert_eq!(tool_message["content"], "bad gateway");
    }
}
