//! Chat-turn request surface, storage seams, and the turn error type.

use crate::api::ChatMessage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::Path;
use tokio::sync::Mutex;

pub mod orchestrator;

pub use orchestrator::ChatPipeline;

/// One inbound chat turn.
///
/// `user_id` is what the session layer resolved; guests arrive as `None`
/// and get a reply without persistence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatTurnRequest {
    pub scenario_id: String,
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl ChatTurnRequest {
    /// Request-shape validation; runs before any network activity.
    pub fn validate(&self) -> Result<(), ChatTurnError> {
        if self.scenario_id.trim().is_empty()
            || self.conversation_id.trim().is_empty()
            || self.messages.is_empty()
        {
            return Err(ChatTurnError::MissingFields);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ChatTurnOutcome {
    pub reply: String,
    /// Set when trace submission failed; the reply itself is unaffected.
    pub trace_warning: Option<String>,
}

#[derive(Debug)]
pub enum ChatTurnError {
    MissingFields,
    ScenarioLookup(String),
    ScenarioNotFound(String),
    Completion(String),
    Persistence(String),
}

impl fmt::Display for ChatTurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatTurnError::MissingFields => write!(f, "Missing required fields"),
            ChatTurnError::ScenarioLookup(detail) => {
                write!(f, "Scenario lookup failed: {detail}")
            }
            ChatTurnError::ScenarioNotFound(id) => write!(f, "Scenario not found: {id}"),
            ChatTurnError::Completion(detail) => write!(f, "Chat completion failed: {detail}"),
            ChatTurnError::Persistence(detail) => {
                write!(f, "Failed to persist chat messages: {detail}")
            }
        }
    }
}

impl StdError for ChatTurnError {}

/// A stored chat scenario: which prompt it uses and its free-form config
/// (tool servers, routing, variables).
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub prompt_key: String,
    #[serde(default)]
    pub config: Option<Value>,
}

/// One persisted conversational row, keyed by (user, scenario, conversation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub user_id: String,
    pub scenario_id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
}

#[async_trait]
pub trait ScenarioStore: Send + Sync {
    async fn fetch_scenario(&self, scenario_id: &str) -> Result<Option<Scenario>, String>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_messages(&self, messages: &[StoredMessage]) -> Result<(), String>;
}

#[derive(Default)]
pub struct InMemoryScenarioStore {
    scenarios: HashMap<String, Scenario>,
}

impl InMemoryScenarioStore {
    pub fn with_scenarios(scenarios: impl IntoIterator<Item = Scenario>) -> Self {
        Self {
            scenarios: scenarios
                .into_iter()
                .map(|scenario| (scenario.id.clone(), scenario))
                .collect(),
        }
    }
}

#[async_trait]
impl ScenarioStore for InMemoryScenarioStore {
    async fn fetch_scenario(&self, scenario_id: &str) -> Result<Option<Scenario>, String> {
        Ok(self.scenarios.get(scenario_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append_messages(&self, messages: &[StoredMessage]) -> Result<(), String> {
        self.messages.lock().await.extend_from_slice(messages);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    scenarios: Vec<ScenarioFileEntry>,
}

#[derive(Debug, Deserialize)]
struct ScenarioFileEntry {
    id: String,
    prompt_key: String,
    #[serde(default)]
    config: Option<toml::Value>,
}

/// Scenario definitions loaded from a TOML file, used by the CLI in place
/// of a relational store.
pub struct FileScenarioStore {
    scenarios: HashMap<String, Scenario>,
}

impl FileScenarioStore {
    pub fn load_from_path(path: &Path) -> Result<Self, Box<dyn StdError>> {
        let contents = std::fs::read_to_string(path)?;
        let file: ScenarioFile = toml::from_str(&contents)?;
        let mut scenarios = HashMap::new();
        for entry in file.scenarios {
            let config = match entry.config {
                Some(value) => Some(serde_json::to_value(value)?),
                None => None,
            };
            scenarios.insert(
                entry.id.clone(),
                Scenario {
                    id: entry.id,
                    prompt_key: entry.prompt_key,
                    config,
                },
            );
        }
        Ok(Self { scenarios })
    }
}

#[async_trait]
impl ScenarioStore for FileScenarioStore {
    async fn fetch_scenario(&self, scenario_id: &str) -> Result<Option<Scenario>, String> {
        Ok(self.scenarios.get(scenario_id).cloned())
    }
}
