//! Language model abstraction.
//!
//! The orchestrator and synthesizer talk to a [`LanguageModel`]: one
//! request, one completion, no streaming. Implementations:
//!
//! - [`ChatCompletionsModel`]: any OpenAI-compatible `/chat/completions`
//!   endpoint (OpenAI, Groq). Temperature is always 0.
//! - [`UnavailableModel`]: every call fails; used when no API key is
//!   configured so requests go straight to the deterministic fallback.
//! - [`ScriptedModel`]: replays canned responses in order; drives the
//!   agent loop deterministically in tests.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Client for OpenAI-compatible chat completion APIs.
pub struct ChatCompletionsModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

const CHAT_MAX_RETRIES: u32 = 2;

impl ChatCompletionsModel {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.resolved_base_url(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": self.max_tokens,
        });
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=CHAT_MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(anyhow!("chat completion request failed: {}", e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let json: serde_json::Value = response.json().await?;
                return json
                    .pointer("/choices/0/message/content")
                    .and_then(|c| c.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("chat completion response has no message content"));
            }

            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = Some(anyhow!("chat completion error {}: {}", status, text));
                continue;
            }
            bail!("chat completion error {}: {}", status, text);
        }

        Err(last_err.unwrap_or_else(|| anyhow!("chat completion failed after retries")))
    }
}

/// A model that is never reachable.
pub struct UnavailableModel {
    reason: String,
}

impl UnavailableModel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for UnavailableModel {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
        Err(anyhow!("language model unavailable: {}", self.reason))
    }
}

/// Replays a fixed sequence of responses, then repeats an optional
/// trailing response forever. Records every prompt it receives.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, String>>>,
    repeat: Option<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            repeat: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with `response`.
    pub fn repeating(response: impl Into<String>) -> Self {
        Self::new(Vec::<String>::new()).then_repeat(response)
    }

    /// After the script runs out, keep answering with `response`.
    pub fn then_repeat(mut self, response: impl Into<String>) -> Self {
        self.repeat = Some(response.into());
        self
    }

    /// Queue a transport failure at the end of the script.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(message.into()));
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("scripted model lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .repeat
                .clone()
                .ok_or_else(|| anyhow!("scripted model has no more responses")),
        }
    }
}

/// Build the configured model. A missing API key yields an
/// [`UnavailableModel`] rather than an error.
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "openai" | "groq" => {
            let key_var = config.resolved_api_key_env();
            match std::env::var(&key_var) {
                Ok(key) if !key.trim().is_empty() => {
                    Ok(Arc::new(ChatCompletionsModel::new(config, key)?))
                }
                _ => {
                    tracing::warn!(
                        env = %key_var,
                        "no API key for language model; answers will use the deterministic fallback"
                    );
                    Ok(Arc::new(UnavailableModel::new(format!("{} not set", key_var))))
                }
            }
        }
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Locate the first balanced JSON object in `text`, ignoring prose and code
/// fences around it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extracts_json_from_fenced_prose() {
        let text = "Here you go:\n```json\n{\"a\": {\"b\": \"}\"}, \"c\": [1]}\n```\nThanks";
        assert_eq!(
            extract_json_object(text),
            Some("{\"a\": {\"b\": \"}\"}, \"c\": [1]}")
        );
        assert_eq!(extract_json_object("no json"), None);
        assert_eq!(extract_json_object("{ unterminated"), None);
    }

    #[tokio::test]
    async fn scripted_model_replays_then_repeats() {
        let model = ScriptedModel::new(["one", "two"]).then_repeat("again");
        let msgs = [ChatMessage::user("hi")];
        assert_eq!(model.complete(&msgs).await.unwrap(), "one");
        assert_eq!(model.complete(&msgs).await.unwrap(), "two");
        assert_eq!(model.complete(&msgs).await.unwrap(), "again");
        assert_eq!(model.calls(), 3);
        assert_eq!(model.prompts().len(), 3);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_error() {
        let model = ScriptedModel::new(["ok"]).then_fail("timeout");
        let msgs = [ChatMessage::user("hi")];
        assert!(model.complete(&msgs).await.is_ok());
        assert!(model.complete(&msgs).await.is_err());
        assert!(model.complete(&msgs).await.is_err());
    }

    #[tokio::test]
    async fn chat_completions_sends_zero_temperature() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({"temperature": 0.0, "model": "gpt-4"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\": true}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: Some(server.uri()),
            ..LlmConfig::default()
        };
        let model = ChatCompletionsModel::new(&config, "test-key".into()).unwrap();
        let out = model.complete(&[ChatMessage::user("hello")]).await.unwrap();
        assert_eq!(out, "{\"ok\": true}");
    }

    #[tokio::test]
    async fn chat_completions_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: Some(server.uri()),
            ..LlmConfig::default()
        };
        let model = ChatCompletionsModel::new(&config, "nope".into()).unwrap();
        let err = model.complete(&[ChatMessage::user("hello")]).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn unavailable_model_always_fails() {
        let model = UnavailableModel::new("OPENAI_API_KEY not set");
        assert!(model.complete(&[]).await.is_err());
    }
}
