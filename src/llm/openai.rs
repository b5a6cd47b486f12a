use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatModel, ChatRequest, ChatResponse, LlmError, RetryPolicy, with_retry};
use crate::config::OpenAiSettings;

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Reasoning models reject any temperature other than the default.
pub fn supports_temperature(model: &str) -> bool {
    !model.starts_with("gpt-5")
}

fn rejects_temperature(err: &LlmError) -> bool {
    matches!(err, LlmError::Status { status: 400, body } if body.contains("unsupported_value") && body.contains("temperature"))
}

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(settings: &OpenAiSettings, api_key: String) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingKey("OPENAI_API_KEY".to_string()));
        }
        let http = reqwest::Client::builder().timeout(Duration::from_secs(settings.timeout_secs)).build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::none(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_once(&self, req: &ChatRequest, temperature: Option<f32>) -> Result<ChatResponse, LlmError> {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system) = &req.system {
            messages.push(WireMessage { role: "system", content: system });
        }
        for m in &req.messages {
            let role = match m.role {
                super::Role::User => "user",
            };
            messages.push(WireMessage { role, content: &m.content });
        }
        let body = CompletionBody { model: &req.model, messages, temperature, max_tokens: req.max_tokens };

        let started = Instant::now();
        let res = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body });
        }
        let parsed: CompletionResponse = res.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        debug!(
            "openai {} answered {} chars to a {}-char prompt in {:?}",
            req.model,
            text.len(),
            req.prompt().len(),
            started.elapsed()
        );
        Ok(ChatResponse {
            text,
            model: parsed.model.unwrap_or_else(|| req.model.clone()),
            prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
            latency: started.elapsed(),
        })
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let temperature = req.temperature.filter(|_| supports_temperature(&req.model));
        match self.send_once(req, temperature).await {
            Err(e) if temperature.is_some() && rejects_temperature(&e) => {
                warn!("{} rejected temperature, retrying without it", req.model);
                self.send_once(req, None).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        with_retry(&self.retry, "openai", || self.send(req)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_is_omitted_for_reasoning_models() {
        assert!(!supports_temperature("gpt-5"));
        assert!(!supports_temperature("gpt-5-mini"));
        assert!(supports_temperature("gpt-4o"));
    }

    #[test]
    fn detects_unsupported_temperature_rejection() {
        let err = LlmError::Status {
            status: 400,
            body: r#"{"error":{"code":"unsupported_value","param":"temperature"}}"#.into(),
        };
        assert!(rejects_temperature(&err));
        assert!(!rejects_temperature(&LlmError::Status { status: 400, body: "other".into() }));
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = OpenAiClient::new(&OpenAiSettings::default(), "  ".into()).err().unwrap();
        assert!(matches!(err, LlmError::MissingKey(_)));
    }

    #[test]
    fn body_skips_absent_fields() {
        let body = CompletionBody {
            model: "gpt-5",
            messages: vec![WireMessage { role: "user", content: "hi" }],
            temperature: None,
            max_tokens: None,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert!(v.get("temperature").is_none());
        assert_eq!(v["messages"][0]["role"], "user");
    }
}
