//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments and runs a single chat turn
//! through the pipeline, printing the reply to stdout.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use directories::ProjectDirs;
use tracing::warn;

use crate::api::ChatMessage;
use crate::chat::{ChatPipeline, ChatTurnRequest, FileScenarioStore, InMemoryMessageStore};
use crate::core::config::PipelineConfig;

#[derive(Parser)]
#[command(name = "scenario-chat")]
#[command(about = "Run scenario-driven AI chat turns with MCP tool orchestration")]
#[command(
    long_about = "Runs one chat turn against a configured scenario: the scenario's prompt is \
resolved from Langfuse (falling back to the raw key), its MCP tool servers are \
queried for catalogs, and up to one round of tool calls is dispatched between \
two completions.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY          API key for the completion endpoint (required)\n\
  OPENAI_BASE_URL         Custom completion base URL (optional)\n\
  OPENAI_MODEL            Model id (optional, defaults to gpt-4o-mini)\n\
  OPENAI_TIMEOUT_MS       Completion timeout in ms (optional, no timeout when unset)\n\
  MCP_SERVER_REGISTRY     JSON array of {name, url, headers?, query?} tool servers\n\
  LANGFUSE_HOST           Langfuse host for prompts and traces (optional)\n\
  LANGFUSE_PUBLIC_KEY     Langfuse public key (optional)\n\
  LANGFUSE_SECRET_KEY     Langfuse secret key (optional)\n\
  LANGFUSE_PROMPT_OPTIONS Curated prompt options as JSON (optional)\n\n\
Scenario definitions load from a TOML file; see --scenarios-file."
)]
pub struct Args {
    /// Scenario id to run the turn against
    #[arg(short, long)]
    pub scenario: String,

    /// Conversation id grouping persisted messages
    #[arg(short, long, default_value = "local")]
    pub conversation: String,

    /// Authenticated user id; omit to run as a guest (no persistence)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Path to the scenario TOML file (defaults to the user config dir)
    #[arg(long, value_name = "PATH")]
    pub scenarios_file: Option<PathBuf>,

    /// The user message for this turn
    pub message: String,
}

fn default_scenarios_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "permacommons", "scenario-chat")
        .map(|dirs| dirs.config_dir().join("scenarios.toml"))
}

pub async fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = PipelineConfig::from_env();

    let scenarios_path = args
        .scenarios_file
        .or_else(default_scenarios_path)
        .ok_or("Failed to determine the scenario file path")?;
    let scenarios = FileScenarioStore::load_from_path(&scenarios_path)?;
    let messages = Arc::new(InMemoryMessageStore::default());
    let pipeline = ChatPipeline::new(config, Arc::new(scenarios), messages)?;

    let request = ChatTurnRequest {
        scenario_id: args.scenario,
        conversation_id: args.conversation,
        user_id: args.user,
        messages: vec![ChatMessage::user(args.message)],
    };
    let outcome = pipeline.handle_turn(request).await?;

    if let Some(warning) = &outcome.trace_warning {
        warn!(%warning, "turn completed with a trace warning");
    }
    println!("{}", outcome.reply);
    Ok(())
}
