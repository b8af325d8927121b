//! Telegram transport
//!
//! Thin wrapper over the Bot API: `sendMessage` for outbound notifications
//! and `getUpdates` long polling for operator commands.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Deadline for one outbound send.
const SEND_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound chat seam, mockable in tests.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API client.
pub struct TelegramClient {
    client: Client,
    token: String,
}

impl TelegramClient {
    /// Create a new client from the `TELEGRAM_BOT_TOKEN` environment
    /// variable.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .context("TELEGRAM_BOT_TOKEN environment variable not set")?;
        Ok(Self::new(token))
    }

    pub fn new(token: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("Failed to create HTTP client"),
            token,
        }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    /// Long-poll for operator messages. `timeout_secs` rides the request to
    /// the Bot API; the HTTP deadline adds headroom on top.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let payload = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        let reply: ApiReply<Vec<Update>> = self
            .client
            .post(self.url("getUpdates"))
            .json(&payload)
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await?
            .json()
            .await?;

        if !reply.ok {
            return Err(anyhow!(
                "getUpdates failed: {}",
                reply.description.unwrap_or_default()
            ));
        }
        Ok(reply.result.unwrap_or_default())
    }
}

#[async_trait]
impl ChatSender for TelegramClient {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(self.url("sendMessage"))
            .json(&payload)
            .timeout(SEND_DEADLINE)
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("sendMessage failed: {}", body));
        }
        debug!("sent {} chars to chat {}", text.len(), chat_id);
        Ok(())
    }
}
