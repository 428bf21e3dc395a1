use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{AnalysisProvider, AnalyzeOutput, ChatMessage, TokenUsage, estimate_usage};

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Provider for any OpenAI-compatible chat completions endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, api_key: String) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for OpenAiCompatProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, model_id: &str, messages: &[ChatMessage]) -> Result<AnalyzeOutput> {
        let req_messages: Vec<OpenAiMessage> = messages
            .iter()
            .map(|m| OpenAiMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();

        let req = OpenAiRequest {
            model: model_id,
            messages: req_messages,
        };

        let res = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&req)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(anyhow!(
                "{} API Error: {}",
                self.id,
                res.text().await.unwrap_or_default()
            ));
        }

        let parsed: OpenAiResponse = res.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let usage = match parsed.usage {
            Some(u) => TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                estimated: false,
            },
            None => estimate_usage(messages, &text),
        };

        Ok(AnalyzeOutput { text, usage })
    }
}
