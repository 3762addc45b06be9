//! chatrelay — a real-time chat-orchestration server mediating browser
//! clients and an upstream LLM provider, with per-tenant tool-calling
//! access to SQL and HTTP data sources.
//!
//! The crate is organized around the collaborators named in the design:
//! a [`codec`] framing the WebSocket wire protocol, a connection [`hub`]
//! fanning frames out to project rooms, a [`streaming`] engine tracking
//! in-flight assistant responses, a [`tools`] registry dispatching
//! model-requested tool calls against project-scoped data sources, a
//! per-tenant [`config_cache`] resolving LLM clients, and the
//! [`orchestrator`] tying all of it into the turn loop. [`store`] and
//! [`llm_client`] are the external collaborators (the relational store
//! and the upstream LLM transport); [`server`] wires everything behind
//! an axum HTTP/WebSocket surface.

pub mod codec;
pub mod config;
pub mod config_cache;
pub mod error;
pub mod hub;
pub mod llm_client;
pub mod orchestrator;
pub mod security;
pub mod server;
pub mod store;
pub mod streaming;
pub mod tools;

pub use codec::Envelope;
pub use config::{DefaultLlmConfig, ServerConfig};
pub use config_cache::ClientConfigCache;
pub use error::{AppError, AppResult};
pub use hub::Hub;
pub use orchestrator::Orchestrator;
pub use streaming::StreamingEngine;
pub use tools::ToolRegistry;
