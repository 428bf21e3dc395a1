//! The analysis-model boundary. The pipeline treats the model as an opaque
//! service: messages in, raw text plus token usage out. Parsing and retry
//! policy live in the pipeline executor, not here.

pub mod openai;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// True when the provider did not report usage and we estimated it.
    pub estimated: bool,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.estimated = self.estimated || other.estimated;
    }
}

/// One raw model response.
#[derive(Debug, Clone)]
pub struct AnalyzeOutput {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Execute one conversation against the given model. Each call is a
    /// fresh session: no state is shared between invocations.
    async fn analyze(&self, model_id: &str, messages: &[ChatMessage]) -> Result<AnalyzeOutput>;
}

fn estimate_tokens_from_chars(char_count: usize) -> u64 {
    (char_count as u64).div_ceil(4)
}

/// Rough usage estimate for providers that do not report token counts.
pub fn estimate_usage(messages: &[ChatMessage], response_text: &str) -> TokenUsage {
    let input_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    let output_chars = response_text.chars().count();
    TokenUsage {
        input_tokens: estimate_tokens_from_chars(input_chars),
        output_tokens: estimate_tokens_from_chars(output_chars),
        estimated: true,
    }
}
