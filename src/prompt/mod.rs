//! Prompt resolution against the Langfuse prompt store.
//!
//! Every failure path here degrades to using the raw prompt key as the
//! system prompt; resolution never fails a chat turn. Interpolation is
//! deliberately permissive: unknown placeholders stay in the rendered text
//! so partially configured prompts still render usefully.

use crate::core::config::{LangfuseConfig, PromptOption};
use crate::utils::url::construct_api_url;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

const PROMPTS_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct ResolvedPrompt {
    pub prompt: String,
    pub config: Option<Value>,
}

impl ResolvedPrompt {
    fn raw_key(prompt_key: &str) -> Self {
        Self {
            prompt: prompt_key.to_string(),
            config: None,
        }
    }
}

/// Fetches the named prompt. Missing credentials, transport failures, and
/// non-success responses all fall back to the raw key.
pub async fn resolve_prompt(
    http: &reqwest::Client,
    langfuse: Option<&LangfuseConfig>,
    prompt_key: &str,
) -> ResolvedPrompt {
    let Some(langfuse) = langfuse else {
        return ResolvedPrompt::raw_key(prompt_key);
    };

    let url = construct_api_url(
        &langfuse.host,
        &format!("api/public/v2/prompts/{prompt_key}"),
    );
    let response = match http
        .get(url)
        .header("Authorization", langfuse.authorization())
        .header("Content-Type", "application/json")
        .send()
        .await
    {
        Ok(response) => response,
        Err(error) => {
            debug!(%error, prompt_key, "prompt fetch failed, using raw key");
            return ResolvedPrompt::raw_key(prompt_key);
        }
    };

    if !response.status().is_success() {
        return ResolvedPrompt::raw_key(prompt_key);
    }

    let data = match response.json::<Value>().await {
        Ok(data) => data,
        Err(error) => {
            debug!(%error, prompt_key, "prompt body unreadable, using raw key");
            return ResolvedPrompt::raw_key(prompt_key);
        }
    };

    ResolvedPrompt {
        prompt: data
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or(prompt_key)
            .to_string(),
        config: data.get("config").cloned().filter(|value| !value.is_null()),
    }
}

/// Substitutes `{{name}}` placeholders from `variables`. Unknown placeholder
/// tokens are preserved byte-for-byte.
pub fn interpolate(template: &str, variables: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            output.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after_open[..end].trim();
        match variables.get(name) {
            Some(value) => output.push_str(value),
            None => output.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    output.push_str(rest);
    output
}

/// Assembles the interpolation variables for one turn: `date`/`year`
/// built-ins, overlaid with `variables` objects from the prompt's store
/// config and then the scenario config (later wins on collision).
pub fn prompt_variables(
    prompt_config: Option<&Value>,
    scenario_config: Option<&Value>,
) -> HashMap<String, String> {
    let now = chrono::Local::now();
    let mut variables = HashMap::from([
        ("date".to_string(), now.format("%Y-%m-%d").to_string()),
        ("year".to_string(), now.format("%Y").to_string()),
    ]);
    for config in [prompt_config, scenario_config].into_iter().flatten() {
        if let Some(overrides) = config.get("variables").and_then(Value::as_object) {
            for (name, value) in overrides {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                variables.insert(name.clone(), rendered);
            }
        }
    }
    variables
}

fn parse_prompt_list(payload: &Value) -> Vec<PromptOption> {
    let entries = payload
        .get("data")
        .and_then(Value::as_array)
        .or_else(|| payload.get("prompts").and_then(Value::as_array));
    let Some(entries) = entries else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let object = entry.as_object()?;
            let key = ["name", "promptName", "key"]
                .iter()
                .find_map(|field| object.get(*field).and_then(Value::as_str))
                .filter(|key| !key.is_empty())?;
            let label = ["label", "title"]
                .iter()
                .find_map(|field| object.get(*field).and_then(Value::as_str))
                .filter(|label| !label.is_empty())
                .unwrap_or(key);
            Some(PromptOption {
                key: key.to_string(),
                label: label.to_string(),
            })
        })
        .collect()
}

/// Fetches the remote prompt catalog, following `meta.totalPages`
/// pagination. Any failure degrades to whatever was collected so far (or
/// nothing), never an error.
pub async fn fetch_prompt_options(
    http: &reqwest::Client,
    langfuse: Option<&LangfuseConfig>,
) -> Vec<PromptOption> {
    let Some(langfuse) = langfuse else {
        return Vec::new();
    };

    let Some((mut options, total_pages)) = fetch_prompt_page(http, langfuse, 1).await else {
        return Vec::new();
    };

    for page in 2..=total_pages {
        let Some((page_options, _)) = fetch_prompt_page(http, langfuse, page).await else {
            break;
        };
        options.extend(page_options);
    }

    options
}

async fn fetch_prompt_page(
    http: &reqwest::Client,
    langfuse: &LangfuseConfig,
    page: u32,
) -> Option<(Vec<PromptOption>, u32)> {
    let url = construct_api_url(&langfuse.host, "api/public/v2/prompts");
    let response = http
        .get(url)
        .query(&[("limit", PROMPTS_PAGE_LIMIT), ("page", page)])
        .header("Authorization", langfuse.authorization())
        .header("Content-Type", "application/json")
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let payload = response.json::<Value>().await.ok()?;
    let total_pages = payload
        .get("meta")
        .and_then(|meta| meta.get("totalPages"))
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;
    Some((parse_prompt_list(&payload), total_pages))
}

/// Merges operator-curated env options with the remote catalog, env entries
/// first, deduplicated by key.
pub async fn list_prompt_options(
    http: &reqwest::Client,
    langfuse: Option<&LangfuseConfig>,
    env_options: &[PromptOption],
) -> Vec<PromptOption> {
    let mut merged: Vec<PromptOption> = env_options.to_vec();
    for option in fetch_prompt_options(http, langfuse).await {
        if !merged.iter().any(|existing| existing.key == option.key) {
            merged.push(option);
        }
    }
    merged
}
