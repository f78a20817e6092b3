//! Non-streaming chat-completion call against an OpenAI-style endpoint.

use super::{ChatMessage, ChatRequest, ChatResponse, ChatToolCall, ChatToolDefinition, Usage};
use crate::core::config::OpenAiConfig;
use crate::utils::url::construct_api_url;
use std::time::Duration;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug)]
pub struct CompletionOutcome {
    pub content: String,
    pub tool_calls: Vec<ChatToolCall>,
    pub usage: Option<Usage>,
}

pub async fn create_chat_completion(
    client: &reqwest::Client,
    openai: &OpenAiConfig,
    messages: &[ChatMessage],
    tools: Option<&[ChatToolDefinition]>,
) -> Result<CompletionOutcome, String> {
    let api_key = openai
        .api_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| "Missing OPENAI_API_KEY".to_string())?;

    let tools = tools.filter(|tools| !tools.is_empty());
    let body = ChatRequest {
        model: openai.model.clone(),
        messages: messages.to_vec(),
        temperature: DEFAULT_TEMPERATURE,
        tool_choice: tools.map(|_| "auto".to_string()),
        tools: tools.map(|tools| tools.to_vec()),
    };

    let url = construct_api_url(&openai.base_url, "chat/completions");
    let mut request = client
        .post(url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&body);
    if let Some(timeout_ms) = openai.timeout_ms {
        request = request.timeout(Duration::from_millis(timeout_ms));
    }

    let response = request.send().await.map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        let trimmed = text.trim();
        return Err(if trimmed.is_empty() {
            "Chat completion request failed".to_string()
        } else {
            trimmed.to_string()
        });
    }

    let data = response
        .json::<ChatResponse>()
        .await
        .map_err(|err| err.to_string())?;
    let mut choices = data.choices;
    let message = if choices.is_empty() {
        None
    } else {
        Some(choices.remove(0).message)
    };

    Ok(CompletionOutcome {
        content: message
            .as_ref()
            .and_then(|message| message.content.clone())
            .unwrap_or_default(),
        tool_calls: message
            .and_then(|message| message.tool_calls)
            .unwrap_or_default(),
        usage: data.usage,
    })
}
