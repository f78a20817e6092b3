//! Scenario-chat is a scenario-driven AI chat pipeline: each turn resolves a
//! stored scenario into a system prompt and a set of remote tool servers,
//! then drives a bounded completion/tool-call loop with best-effort tracing.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the explicit process configuration (server registry,
//!   Langfuse credentials, completion endpoint settings).
//! - [`mcp`] provides Model Context Protocol integration: the registry and
//!   scenario-config normalization, the dual-variant protocol client, and
//!   per-turn tool preparation.
//! - [`prompt`] resolves and interpolates prompt templates from the prompt
//!   store, degrading to the raw key when the store is unavailable.
//! - [`chat`] validates inbound turns and runs the orchestration loop.
//! - [`trace`] assembles and submits the per-turn observability batch.
//! - [`api`] defines the chat/tool payloads used by the completion client.
//!
//! The runtime entrypoint lives in the binary crate (`src/main.rs`) and
//! routes through [`crate::cli::run`].

pub mod api;
pub mod chat;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod prompt;
pub mod trace;
pub mod utils;
