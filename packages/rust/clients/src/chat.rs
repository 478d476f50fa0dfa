//! OpenAI-compatible chat-completions client (OpenRouter by default).

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use knowcrawl_shared::{KnowCrawlError, LlmConfig, Result};

use crate::{LlmClient, USER_AGENT};

/// Longest slice of an error body echoed into a service error.
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Single-turn chat-completions client.
pub struct ChatClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
}

impl ChatClient {
    /// Build a client from `[llm]` config and an already-resolved API key.
    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KnowCrawlError::config(format!("client build: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

impl LlmClient for ChatClient {
    #[instrument(skip_all, fields(model = %self.model, prompt_len = prompt.len()))]
    async fn complete(&self, prompt: &str) -> Result<String> {
        let start = Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| KnowCrawlError::service(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| KnowCrawlError::service(format!("{}: {e}", self.endpoint)))?;

        if !status.is_success() {
            let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
            return Err(KnowCrawlError::service(format!(
                "{}: HTTP {status}: {preview}",
                self.endpoint
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| KnowCrawlError::service(format!("malformed completion response: {e}")))?;

        let usage = parsed.usage.unwrap_or_default();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| KnowCrawlError::service("completion response has no content"))?;

        debug!(
            tokens_in = usage.prompt_tokens,
            tokens_out = usage.completion_tokens,
            latency_ms = start.elapsed().as_millis() as u64,
            "completion received"
        );

        Ok(content)
    }
}
