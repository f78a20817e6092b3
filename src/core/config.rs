//! Process-wide pipeline configuration.
//!
//! Everything environment-derived is read exactly once, here, into an
//! explicit object that is passed by reference into the registry, prompt,
//! and trace components. Request handling never consults the environment.

use crate::mcp::registry::ServerRegistry;
use crate::utils::url::normalize_base_url;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::env;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Credentials for the Langfuse prompt store and trace sink. Absent as a
/// whole when any of the three values is unset.
#[derive(Debug, Clone)]
pub struct LangfuseConfig {
    pub host: String,
    pub public_key: String,
    pub secret_key: String,
}

impl LangfuseConfig {
    pub fn authorization(&self) -> String {
        let credentials = format!("{}:{}", self.public_key, self.secret_key);
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// The completion endpoint historically ran without a timeout; opt in
    /// explicitly when one is wanted.
    pub timeout_ms: Option<u64>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            timeout_ms: None,
        }
    }
}

/// An operator-curated prompt choice shown by admin surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOption {
    pub key: String,
    pub label: String,
}

/// Parses the `LANGFUSE_PROMPT_OPTIONS` JSON document: an array of strings
/// or `{key, label}` objects. Anything malformed degrades to no options.
pub fn parse_prompt_options(raw: Option<&str>) -> Vec<PromptOption> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    let Some(entries) = parsed.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(key) => Some(PromptOption {
                key: key.clone(),
                label: key.clone(),
            }),
            Value::Object(object) => {
                let key = object.get("key")?.as_str()?.to_string();
                let label = object
                    .get("label")
                    .and_then(Value::as_str)
                    .unwrap_or(&key)
                    .to_string();
                Some(PromptOption { key, label })
            }
            _ => None,
        })
        .filter(|option| !option.key.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub registry: ServerRegistry,
    pub langfuse: Option<LangfuseConfig>,
    pub prompt_options: Vec<PromptOption>,
    pub openai: OpenAiConfig,
}

impl PipelineConfig {
    /// Reads the full configuration from the environment, once.
    pub fn from_env() -> Self {
        let registry = ServerRegistry::from_raw(env_non_empty("MCP_SERVER_REGISTRY").as_deref());
        let langfuse = match (
            env_non_empty("LANGFUSE_HOST"),
            env_non_empty("LANGFUSE_PUBLIC_KEY"),
            env_non_empty("LANGFUSE_SECRET_KEY"),
        ) {
            (Some(host), Some(public_key), Some(secret_key)) => Some(LangfuseConfig {
                host: normalize_base_url(&host),
                public_key,
                secret_key,
            }),
            _ => None,
        };
        let prompt_options =
            parse_prompt_options(env_non_empty("LANGFUSE_PROMPT_OPTIONS").as_deref());
        let openai = OpenAiConfig {
            api_key: env_non_empty("OPENAI_API_KEY"),
            base_url: env_non_empty("OPENAI_BASE_URL")
                .map(|url| normalize_base_url(&url))
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            model: env_non_empty("OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            timeout_ms: env_non_empty("OPENAI_TIMEOUT_MS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .filter(|millis| *millis > 0),
        };

        Self {
            registry,
            langfuse,
            prompt_options,
            openai,
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_options_accept_strings_and_objects() {
        let raw = r#"["daily-brief", {"key": "support", "label": "客服"}, {"label": "no key"}, 7]"#;
        let options = parse_prompt_options(Some(raw));
        assert_eq!(
            options,
            vec![
                PromptOption {
                    key: "daily-brief".to_string(),
                    label: "daily-brief".to_string(),
                },
                PromptOption {
                    key: "support".to_string(),
                    label: "客服".to_string(),
                },
            ]
        );
    }

    #[test]
    fn prompt_options_degrade_to_empty_on_bad_input() {
        assert!(parse_prompt_options(None).is_empty());
        assert!(parse_prompt_options(Some("not json")).is_empty());
        assert!(parse_prompt_options(Some("{\"key\": \"x\"}")).is_empty());
    }

    #[test]
    fn langfuse_authorization_is_basic_auth() {
        let config = LangfuseConfig {
            host: "https://cloud.langfuse.com".to_string(),
            public_key: "pk".to_string(),
            secret_key: "sk".to_string(),
        };
        // base64("pk:sk")
        assert_eq!(config.authorization(), "Basic cGs6c2s=");
    }
}
