//! Text generation capability used by the query engine.
//!
//! Providers receive a [`GroundedPrompt`] (system + user message) and return
//! the model's answer. They never retry and never invent a fallback answer:
//! every failure is a [`GenerationError`] for the caller to surface.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::GenerationError;

/// The two-message prompt sent to a chat model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedPrompt {
    pub system: String,
    pub user: String,
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub tokens_used: Option<u32>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &GroundedPrompt) -> Result<Generation, GenerationError>;
}

/// Generator used when no provider is configured.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &GroundedPrompt) -> Result<Generation, GenerationError> {
        Err(GenerationError(
            "Generation provider is disabled. Set [generation] provider in config.".to_string(),
        ))
    }
}

/// Chat completions against the OpenAI API (`POST /v1/chat/completions`).
pub struct OpenAIGenerator {
    model: String,
    api_key: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &GroundedPrompt) -> Result<Generation, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = send("OpenAI", request).await?;
        parse_openai_chat(&json)
    }
}

fn parse_openai_chat(json: &serde_json::Value) -> Result<Generation, GenerationError> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| GenerationError("Invalid OpenAI response: missing message content".into()))?;
    let tokens_used = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_u64())
        .map(|t| t as u32);
    Ok(Generation {
        text: text.to_string(),
        tokens_used,
    })
}

/// Non-streaming chat against a local Ollama instance (`POST /api/chat`).
pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &GroundedPrompt) -> Result<Generation, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "options": { "temperature": self.temperature },
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });
        let request = self.client.post(format!("{}/api/chat", self.url)).json(&body);
        let json = send("Ollama", request).await?;
        let text = json
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| GenerationError("Invalid Ollama response: missing message content".into()))?;
        let tokens_used = match (
            json.get("prompt_eval_count").and_then(|t| t.as_u64()),
            json.get("eval_count").and_then(|t| t.as_u64()),
        ) {
            (Some(p), Some(e)) => Some((p + e) as u32),
            _ => None,
        };
        Ok(Generation {
            text: text.to_string(),
            tokens_used,
        })
    }
}

async fn send(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, GenerationError> {
    let response = request
        .send()
        .await
        .map_err(|e| GenerationError(format!("{} request failed: {}", provider, e)))?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(GenerationError(format!(
            "{} API error {}: {}",
            provider, status, body_text
        )));
    }
    response
        .json()
        .await
        .map_err(|e| GenerationError(format!("{} returned malformed JSON: {}", provider, e)))
}

pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}
