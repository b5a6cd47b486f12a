use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatModel, ChatRequest, ChatResponse, LlmError, Message, RetryPolicy, with_retry};
use crate::config::AnthropicSettings;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

fn joined_text(blocks: Vec<ContentBlock>) -> String {
    blocks
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("")
}

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    default_max_tokens: u32,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(settings: &AnthropicSettings, api_key: String) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingKey("ANTHROPIC_API_KEY".to_string()));
        }
        let http = reqwest::Client::builder().timeout(Duration::from_secs(settings.timeout_secs)).build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_max_tokens: settings.max_tokens,
            retry: RetryPolicy::none(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = MessagesBody {
            model: &req.model,
            max_tokens: req.max_tokens.unwrap_or(self.default_max_tokens),
            temperature: req.temperature,
            system: req.system.as_deref(),
            messages: &req.messages,
        };
        let started = Instant::now();
        let res = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body });
        }
        let parsed: MessagesResponse = res.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;
        let text = joined_text(parsed.content);
        debug!(
            "anthropic {} answered {} chars to a {}-char prompt in {:?}",
            req.model,
            text.len(),
            req.prompt().len(),
            started.elapsed()
        );
        Ok(ChatResponse {
            text,
            model: parsed.model.unwrap_or_else(|| req.model.clone()),
            prompt_tokens: parsed.usage.as_ref().and_then(|u| u.input_tokens),
            completion_tokens: parsed.usage.as_ref().and_then(|u| u.output_tokens),
            latency: started.elapsed(),
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        with_retry(&self.retry, "anthropic", || self.send(req)).await
    }
}
