//! Advisor gateway: prompt assembly, LLM transport and reply validation.
//!
//! The advisor's reply is untyped text; nothing past this module ever sees
//! it. The gateway parses and validates every reply and re-prompts once with
//! the validation error before giving up on a trigger.

pub mod client;
pub mod gateway;
pub mod prompt;

pub use client::{AdvisorTransport, ChatPrompt, OpenAiClient};
pub use gateway::AdvisorGateway;

/// Advisor failure modes. `Timeout` and `Transient` get one retry;
/// `Rejected` is terminal for the trigger.
#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("advisor call timed out")]
    Timeout,
    #[error("transient advisor error: {0}")]
    Transient(String),
    #[error("advisor reply rejected: {0}")]
    Rejected(String),
}

impl AdvisorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}
