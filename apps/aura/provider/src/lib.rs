//! Aura provider agent: holds a provider connection to the relay and answers
//! `generate` requests by streaming chunks from a local model server.

pub mod agent;
pub mod config;
pub mod engine;

pub use agent::{Agent, AgentError, Exit};
pub use config::{Cli, ProviderConfig};
pub use engine::{ChunkStream, EngineError, GenerateChunk, GenerationEngine, OllamaEngine};
