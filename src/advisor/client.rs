//! Advisor transport
//!
//! One method: `complete(prompt, deadline) -> String`. The production
//! implementation talks to an OpenAI-compatible chat-completions endpoint;
//! tests script the trait directly. Model identity is configuration, not
//! part of the contract.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::AdvisorError;

/// Default chat-completions endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Default model when `ADVISOR_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// A two-part chat prompt.
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub system: String,
    pub user: String,
}

impl ChatPrompt {
    /// Clone of this prompt with a validation error appended to the user
    /// message, for the gateway's single re-prompt.
    pub fn with_validation_error(&self, error: &str) -> Self {
        Self {
            system: self.system.clone(),
            user: format!(
                "{}\n\nYour previous reply was rejected: {}\nReply again with a single \
                 corrected JSON object and nothing else.",
                self.user, error
            ),
        }
    }
}

/// The transport seam the gateway talks through.
#[async_trait]
pub trait AdvisorTransport: Send + Sync {
    async fn complete(&self, prompt: &ChatPrompt, deadline: Duration)
        -> Result<String, AdvisorError>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    /// Create a new client from environment variables
    ///
    /// Expects:
    /// - `ADVISOR_API_KEY` (or `OPENAI_API_KEY`)
    /// - `ADVISOR_BASE_URL` (optional, defaults to the OpenAI endpoint)
    /// - `ADVISOR_MODEL` (optional)
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ADVISOR_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .context("ADVISOR_API_KEY environment variable not set")?;
        let base_url =
            std::env::var("ADVISOR_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("ADVISOR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(api_key, base_url, model))
    }

    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(90))
                .build()
                .expect("Failed to create HTTP client"),
            base_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl AdvisorTransport for OpenAiClient {
    async fn complete(
        &self,
        prompt: &ChatPrompt,
        deadline: Duration,
    ) -> Result<String, AdvisorError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdvisorError::Timeout
                } else {
                    AdvisorError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdvisorError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AdvisorError::Transient(format!("malformed completion: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AdvisorError::Rejected("completion has no choices".to_string()))?;

        debug!("advisor returned {} chars", content.len());
        Ok(content)
    }
}
