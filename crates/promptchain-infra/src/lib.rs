//! Infrastructure adapters for PromptChain.
//!
//! Concrete implementations of the capability seams defined in
//! `promptchain-core`: LLM provider clients (OpenAI with sync + batch,
//! Ollama sync-only) and the environment-driven provider factory.

pub mod llm;
pub mod providers;

pub use providers::ProviderFactory;
