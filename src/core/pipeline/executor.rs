//! Runs one analyst invocation against the model boundary: bounded retries
//! on the primary model, then the same attempt loop on the fallback model,
//! with every attempt issuing a fresh conversation so a malformed response
//! cannot poison the next try. The execution ledger row brackets the whole
//! thing; token counts accumulate across all attempts and both tiers.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::core::config::EngineConfig;
use crate::core::events::EventBus;
use crate::core::llm::{AnalysisProvider, ChatMessage, TokenUsage};
use crate::core::store::{CaseStore, NewExecution};

use super::types::AnalystKind;

const ERROR_TRUNCATE_LIMIT: usize = 1000;

/// Everything needed to invoke one analyst. The prompt fields are built once
/// by the caller; the executor derives a fresh message vector from them for
/// every attempt.
#[derive(Debug, Clone)]
pub struct AnalystRequest {
    pub case_id: String,
    pub workflow_id: String,
    pub analyst: AnalystKind,
    pub analyst_name: String,
    pub parent_execution_id: Option<String>,
    pub system_prompt: String,
    pub user_payload: String,
}

/// Extract a JSON block from model output. Tries fenced ```json ... ``` first,
/// then raw JSON starting with `{` or `[`.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    None
}

fn parse_structured_output(text: &str) -> Result<Value> {
    let block =
        extract_json_block(text).ok_or_else(|| anyhow!("response contains no JSON block"))?;
    let value: Value = serde_json::from_str(block)?;
    Ok(value)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

/// Mark structured output as produced by the fallback tier so downstream
/// consumers can weigh it accordingly.
fn tag_fallback(output: Value) -> Value {
    match output {
        Value::Object(mut map) => {
            map.insert("derived_via_fallback".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "value": other, "derived_via_fallback": true }),
    }
}

/// Run one analyst to completion. Returns the structured output, or `None`
/// when every attempt on both model tiers failed — callers must treat `None`
/// as a recorded task failure, never as fatal to the surrounding pipeline.
pub async fn run_analyst(
    store: &CaseStore,
    provider: Arc<dyn AnalysisProvider>,
    bus: Arc<EventBus>,
    config: &EngineConfig,
    req: &AnalystRequest,
) -> Option<Value> {
    let execution = match store
        .create_execution(NewExecution {
            case_id: &req.case_id,
            workflow_id: &req.workflow_id,
            analyst_name: &req.analyst_name,
            analyst_kind: req.analyst.as_str(),
            model: &config.primary_model,
            parent_execution_id: req.parent_execution_id.as_deref(),
            input_json: &json!({
                "system": truncate(&req.system_prompt, config.output_truncate_limit),
                "payload": truncate(&req.user_payload, config.output_truncate_limit),
            })
            .to_string(),
        })
        .await
    {
        Ok(execution) => execution,
        Err(e) => {
            error!(
                "Could not open a ledger row for analyst [{}]: {}",
                req.analyst_name, e
            );
            bus.publish(
                &req.case_id,
                req.analyst.as_str(),
                "analyst_failed",
                json!({
                    "analyst": req.analyst_name,
                    "error": truncate(&e.to_string(), ERROR_TRUNCATE_LIMIT),
                }),
            );
            return None;
        }
    };

    match run_analyst_inner(store, provider, bus.clone(), config, req, &execution.execution_id)
        .await
    {
        Ok(output) => output,
        Err(e) => {
            // Unexpected failure outside the retry loop (ledger I/O and the
            // like). The row exists by now and must still end terminal.
            let message = truncate(&e.to_string(), ERROR_TRUNCATE_LIMIT);
            error!(
                "Analyst [{}] execution error for case [{}]: {}",
                req.analyst_name, req.case_id, message
            );
            if let Err(store_err) = store
                .fail_execution(&execution.execution_id, &message, 0, 0)
                .await
            {
                error!(
                    "Could not mark execution [{}] failed: {}",
                    execution.execution_id, store_err
                );
            }
            bus.publish(
                &req.case_id,
                req.analyst.as_str(),
                "analyst_failed",
                json!({
                    "execution_id": execution.execution_id,
                    "analyst": req.analyst_name,
                    "error": message,
                }),
            );
            None
        }
    }
}

async fn run_analyst_inner(
    store: &CaseStore,
    provider: Arc<dyn AnalysisProvider>,
    bus: Arc<EventBus>,
    config: &EngineConfig,
    req: &AnalystRequest,
    execution_id: &str,
) -> Result<Option<Value>> {
    store.mark_execution_running(execution_id).await?;

    bus.publish(
        &req.case_id,
        req.analyst.as_str(),
        "analyst_started",
        json!({
            "execution_id": execution_id,
            "analyst": req.analyst_name,
            "model": config.primary_model,
        }),
    );

    let mut usage = TokenUsage::default();
    let mut last_error = String::new();

    let primary = attempt_tier(
        store,
        provider.as_ref(),
        config,
        req,
        execution_id,
        &config.primary_model,
        &mut usage,
        &mut last_error,
    )
    .await;

    let (output, model_used, via_fallback) = match primary {
        Some(value) => (Some(value), config.primary_model.clone(), false),
        None => {
            warn!(
                "Analyst [{}] exhausted primary tier [{}], falling back to [{}]",
                req.analyst_name, config.primary_model, config.fallback_model
            );
            let fallback = attempt_tier(
                store,
                provider.as_ref(),
                config,
                req,
                execution_id,
                &config.fallback_model,
                &mut usage,
                &mut last_error,
            )
            .await;
            (fallback, config.fallback_model.clone(), true)
        }
    };

    match output {
        Some(value) => {
            let value = if via_fallback {
                bus.publish(
                    &req.case_id,
                    req.analyst.as_str(),
                    "fallback_warning",
                    json!({
                        "execution_id": execution_id,
                        "analyst": req.analyst_name,
                        "fallback_model": model_used,
                    }),
                );
                tag_fallback(value)
            } else {
                value
            };
            store
                .complete_execution(
                    execution_id,
                    &truncate(&value.to_string(), config.output_truncate_limit),
                    &model_used,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                )
                .await?;
            bus.publish(
                &req.case_id,
                req.analyst.as_str(),
                "analyst_completed",
                json!({
                    "execution_id": execution_id,
                    "analyst": req.analyst_name,
                    "model": model_used,
                }),
            );
            Ok(Some(value))
        }
        None => {
            let message = truncate(&last_error, ERROR_TRUNCATE_LIMIT);
            store
                .fail_execution(
                    execution_id,
                    &message,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                )
                .await?;
            bus.publish(
                &req.case_id,
                req.analyst.as_str(),
                "analyst_failed",
                json!({
                    "execution_id": execution_id,
                    "analyst": req.analyst_name,
                    "error": message,
                }),
            );
            Ok(None)
        }
    }
}

/// Attempt loop for one model tier: `1 + max_retries` calls, each with a
/// fresh message vector. Transport failures and parse failures are treated
/// identically. Returns the first well-formed output, accumulating token
/// usage from every attempt into `usage`.
#[allow(clippy::too_many_arguments)]
async fn attempt_tier(
    store: &CaseStore,
    provider: &dyn AnalysisProvider,
    config: &EngineConfig,
    req: &AnalystRequest,
    execution_id: &str,
    model: &str,
    usage: &mut TokenUsage,
    last_error: &mut String,
) -> Option<Value> {
    for attempt in 0..=config.max_retries {
        // Fresh conversation per attempt: no shared mutable context.
        let messages = vec![
            ChatMessage::system(req.system_prompt.clone()),
            ChatMessage::user(req.user_payload.clone()),
        ];

        match provider.analyze(model, &messages).await {
            Ok(response) => {
                usage.accumulate(response.usage);
                match parse_structured_output(&response.text) {
                    Ok(value) => return Some(value),
                    Err(e) => {
                        *last_error = format!("malformed analyst output: {}", e);
                        warn!(
                            "Analyst [{}] attempt {}/{} on [{}] returned malformed output: {}",
                            req.analyst_name,
                            attempt + 1,
                            config.max_retries + 1,
                            model,
                            e
                        );
                    }
                }
            }
            Err(e) => {
                *last_error = e.to_string();
                warn!(
                    "Analyst [{}] attempt {}/{} on [{}] failed: {}",
                    req.analyst_name,
                    attempt + 1,
                    config.max_retries + 1,
                    model,
                    e
                );
            }
        }

        if attempt < config.max_retries {
            let _ = store.mark_execution_retrying(execution_id).await;
        }
    }
    None
}
