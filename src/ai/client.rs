//! Chat-completion clients.
//!
//! [`LlmClient`] is the seam between the enhancer and the network. The
//! OpenAI implementation retries 429/5xx and network errors with the same
//! backoff the embedding providers use; callers put their own deadline
//! around the whole call.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AiConfig;

/// One chat completion: a system prompt and a user prompt.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Model output and the tokens the provider billed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Tokens billed for the call, prompt and completion together.
    pub tokens_used: u64,
}

/// A chat-completion provider. Tests substitute their own.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Builds the configured client. `None` means AI is off: either disabled in
/// config or the API key is missing.
pub fn create_client(config: &AiConfig) -> Result<Option<Arc<dyn LlmClient>>> {
    if !config.enabled {
        return Ok(None);
    }
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(Some(Arc::new(OpenAiChatClient::new(config, key)?))),
            _ => {
                tracing::warn!("ai.enabled is set but OPENAI_API_KEY is not; AI enhancement stays off");
                Ok(None)
            }
        },
        other => bail!("Unknown ai provider: {}", other),
    }
}

/// OpenAI-compatible `/chat/completions` client with retry on 429 and 5xx.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiChatClient {
    pub fn new(config: &AiConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json, request);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("chat API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("chat API error {}: {}", status, body_text);
                }
                Err(e) => last_err = Some(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("chat completion failed after retries")))
    }
}

fn parse_chat_response(json: &serde_json::Value, request: &CompletionRequest) -> Result<Completion> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))?;
    if text.is_empty() {
        bail!("Invalid chat response: empty content");
    }

    // Providers that omit usage still get charged, by estimate.
    let tokens_used = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_u64())
        .unwrap_or_else(|| {
            super::estimate_tokens(&request.system)
                + super::estimate_tokens(&request.prompt)
                + super::estimate_tokens(&text)
        });

    Ok(Completion { text, tokens_used })
}
