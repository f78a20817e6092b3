//! Best-effort turn tracing against the Langfuse ingestion endpoint.
//!
//! One trace is assembled per chat turn and submitted exactly once, after
//! the reply is final. Submission is modeled as an explicit `Result` so the
//! caller can log-and-continue; nothing in this module panics or propagates
//! a transport failure.

use crate::api::Usage;
use crate::core::config::LangfuseConfig;
use crate::utils::url::construct_api_url;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

pub const TRACE_SKIPPED_NOT_CONFIGURED: &str = "Langfuse 未配置，跳过上报。";

/// One LLM call within a turn.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub id: String,
    pub name: String,
    pub model: String,
    pub input: Value,
    pub output: String,
    pub usage: Option<Usage>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl GenerationRecord {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        input: Value,
        output: impl Into<String>,
        usage: Option<Usage>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            model: model.into(),
            input,
            output: output.into(),
            usage,
            start_time,
            end_time: Utc::now(),
        }
    }
}

/// One remote tool invocation within a turn.
#[derive(Debug, Clone)]
pub struct ToolSpanRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ToolSpanRecord {
    pub fn success(
        name: impl Into<String>,
        input: Value,
        output: Value,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            input,
            output: Some(output),
            error: None,
            start_time,
            end_time: Utc::now(),
        }
    }

    pub fn failure(
        name: impl Into<String>,
        input: Value,
        error: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            input,
            output: None,
            error: Some(error.into()),
            start_time,
            end_time: Utc::now(),
        }
    }
}

/// The whole turn: one root trace, its generations, and its tool spans.
#[derive(Debug, Clone)]
pub struct ChatTrace {
    pub id: String,
    pub name: String,
    pub user_id: Option<String>,
    pub input: Value,
    pub output: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
    pub generations: Vec<GenerationRecord>,
    pub spans: Vec<ToolSpanRecord>,
}

impl ChatTrace {
    pub fn new(name: impl Into<String>, user_id: Option<String>, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            user_id,
            input: Value::Null,
            output: String::new(),
            metadata,
            timestamp: Utc::now(),
            generations: Vec::new(),
            spans: Vec::new(),
        }
    }
}

fn ingestion_event(event_type: &str, body: Value) -> Value {
    json!({
        "id": Uuid::new_v4().to_string(),
        "type": event_type,
        "timestamp": Utc::now().to_rfc3339(),
        "body": body,
    })
}

fn usage_body(usage: &Usage) -> Value {
    json!({
        "input": usage.prompt_tokens,
        "output": usage.completion_tokens,
        "total": usage.total_tokens,
    })
}

fn build_batch(trace: &ChatTrace) -> Vec<Value> {
    let mut batch = Vec::with_capacity(1 + trace.generations.len() + trace.spans.len());
    batch.push(ingestion_event(
        "trace-create",
        json!({
            "id": trace.id,
            "name": trace.name,
            "userId": trace.user_id,
            "input": trace.input,
            "output": trace.output,
            "metadata": trace.metadata,
            "timestamp": trace.timestamp.to_rfc3339(),
        }),
    ));

    for generation in &trace.generations {
        batch.push(ingestion_event(
            "generation-create",
            json!({
                "id": generation.id,
                "traceId": trace.id,
                "name": generation.name,
                "model": generation.model,
                "input": generation.input,
                "output": generation.output,
                "usage": generation.usage.as_ref().map(usage_body),
                "startTime": generation.start_time.to_rfc3339(),
                "endTime": generation.end_time.to_rfc3339(),
            }),
        ));
    }

    for span in &trace.spans {
        batch.push(ingestion_event(
            "span-create",
            json!({
                "id": span.id,
                "traceId": trace.id,
                "name": span.name,
                "input": span.input,
                "output": span.output,
                "level": span.error.as_ref().map(|_| "ERROR"),
                "statusMessage": span.error,
                "startTime": span.start_time.to_rfc3339(),
                "endTime": span.end_time.to_rfc3339(),
            }),
        ));
    }

    batch
}

fn summarize_item_errors(body: &Value) -> Option<String> {
    let errors = body.get("errors").and_then(Value::as_array)?;
    if errors.is_empty() {
        return None;
    }
    let details: Vec<String> = errors
        .iter()
        .map(|item| {
            item.get("message")
                .or_else(|| item.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| item.to_string())
        })
        .collect();
    Some(format!(
        "Langfuse ingestion rejected {} event(s): {}",
        details.len(),
        details.join("; ")
    ))
}

#[derive(Clone)]
pub struct TraceReporter {
    http: reqwest::Client,
    langfuse: Option<LangfuseConfig>,
}

impl TraceReporter {
    pub fn new(http: reqwest::Client, langfuse: Option<LangfuseConfig>) -> Self {
        Self { http, langfuse }
    }

    /// Submits the turn's batch. Every failure mode, including absent
    /// credentials, comes back as `Err(summary)` for the caller to log.
    pub async fn submit(&self, trace: &ChatTrace) -> Result<(), String> {
        let Some(langfuse) = &self.langfuse else {
            return Err(TRACE_SKIPPED_NOT_CONFIGURED.to_string());
        };

        let url = construct_api_url(&langfuse.host, "api/public/ingestion");
        let response = self
            .http
            .post(url)
            .header("Authorization", langfuse.authorization())
            .json(&json!({"batch": build_batch(trace)}))
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail = text.trim();
            return Err(if detail.is_empty() {
                format!("Langfuse ingestion failed ({})", status.as_u16())
            } else {
                format!("Langfuse ingestion failed ({}): {}", status.as_u16(), detail)
            });
        }

        if let Some(summary) = serde_json::from_str::<Value>(&text)
            .ok()
            .as_ref()
            .and_then(summarize_item_errors)
        {
            return Err(summary);
        }

        Ok(())
    }
}
