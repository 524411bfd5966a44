//! CogWorks LLM provider infrastructure adapter.
//!
//! Implements [`pipeline::ports::LlmProvider`] for Anthropic's Messages API.
//! Additional providers are added as new implementations in this crate
//! without any change to the `pipeline` crate.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, prompt assembly, response parsing,
//! JSON extraction and cost accounting live here. Transient HTTP failures are
//! classified as retryable [`pipeline::ports::DelegateError::Transport`]
//! errors carrying any `Retry-After` hint; the retry loop itself belongs to
//! the `nodes` crate.

pub mod anthropic;
pub mod extract;
pub mod prompt;

pub use anthropic::{AnthropicConfig, AnthropicProvider, Pricing};

/// Errors raised while constructing a provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("LLM provider configuration error: {0}")]
    Config(String),
}
