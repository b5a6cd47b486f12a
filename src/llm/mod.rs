//! Chat-model abstraction shared by every stage that talks to an LLM.
//!
//! Stages hold an `Arc<dyn ChatModel>` so the OpenAI and Anthropic clients are
//! interchangeable, and tests can substitute a scripted model.

pub mod anthropic;
pub mod monitor;
pub mod openai;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use anthropic::AnthropicClient;
pub use monitor::UsageMonitor;
pub use openai::OpenAiClient;
pub use retry::{RetryPolicy, with_retry};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("LLM request timed out")]
    Timeout,

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("missing API key: {0}")]
    MissingKey(String),
}

impl LlmError {
    /// Timeouts, dropped connections, rate limits and server faults.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Request(_) => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::Parse(e.to_string())
        } else {
            LlmError::Request(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into(), system: None, messages: Vec::new(), temperature: None, max_tokens: None }
    }

    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.system = Some(text.into());
        self
    }

    pub fn user(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message { role: Role::User, content: text.into() });
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Text of the last user message.
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub latency: Duration,
}

impl ChatResponse {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.unwrap_or(0) + self.completion_tokens.unwrap_or(0)
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays canned replies in order and records every request.
    /// Once the script is exhausted every call fails with `EmptyResponse`.
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        pub seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        pub fn new<I, S>(replies: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self::default()
        }

        pub fn push_err(&self, err: LlmError) {
            self.replies.lock().unwrap().push_back(Err(err));
        }

        pub fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        pub fn prompt(&self, i: usize) -> String {
            self.seen.lock().unwrap()[i].prompt().to_string()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
            self.seen.lock().unwrap().push(req.clone());
            let next = self.replies.lock().unwrap().pop_front().unwrap_or(Err(LlmError::EmptyResponse));
            next.map(|text| ChatResponse {
                text,
                model: req.model.clone(),
                prompt_tokens: Some(10),
                completion_tokens: Some(20),
                latency: Duration::from_millis(5),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(LlmError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!LlmError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!LlmError::Parse("x".into()).is_retryable());
    }

    #[test]
    fn request_builder_keeps_last_prompt() {
        let req = ChatRequest::new("m").system("sys").user("first").user("second").max_tokens(10);
        assert_eq!(req.prompt(), "second");
        assert_eq!(req.system.as_deref(), Some("sys"));
        assert_eq!(req.max_tokens, Some(10));
        assert_eq!(req.temperature, None);
    }
}
