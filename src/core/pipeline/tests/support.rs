//! Shared test scaffolding: a scripted analysis provider and a pipeline
//! context backed by a throwaway database.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use crate::core::config::EngineConfig;
use crate::core::confirm::ConfirmationGate;
use crate::core::events::EventBus;
use crate::core::llm::{AnalysisProvider, AnalyzeOutput, ChatMessage, TokenUsage};
use crate::core::pipeline::PipelineContext;
use crate::core::store::CaseStore;

#[derive(Clone)]
pub enum Scripted {
    Reply(String),
    TransportError(String),
    Panic,
}

struct Script {
    needle: &'static str,
    model: Option<&'static str>,
    responses: VecDeque<Scripted>,
}

/// Provider whose responses are scripted per analyst. A script matches when
/// its needle appears in the system prompt (and its model filter, if any,
/// matches). The last response in a script repeats forever.
#[derive(Default)]
pub struct MockProvider {
    scripts: Mutex<Vec<Script>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, needle: &'static str, responses: Vec<Scripted>) {
        self.script_for_model(needle, None, responses);
    }

    pub fn script_for_model(
        &self,
        needle: &'static str,
        model: Option<&'static str>,
        responses: Vec<Scripted>,
    ) {
        self.scripts.lock().unwrap().push(Script {
            needle,
            model,
            responses: responses.into(),
        });
    }

    /// Convenience: one well-formed JSON reply, repeated forever.
    pub fn reply(&self, needle: &'static str, json: Value) {
        self.script(needle, vec![Scripted::Reply(json.to_string())]);
    }

    /// Calls made against `model` whose system prompt contains `needle`.
    pub fn call_count(&self, model: &str, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, system)| m == model && system.contains(needle))
            .count()
    }
}

#[async_trait]
impl AnalysisProvider for MockProvider {
    fn provider_id(&self) -> &str {
        "mock"
    }

    async fn analyze(&self, model_id: &str, messages: &[ChatMessage]) -> Result<AnalyzeOutput> {
        let system = messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls
            .lock()
            .unwrap()
            .push((model_id.to_string(), system.clone()));

        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .iter_mut()
                .find(|s| {
                    system.contains(s.needle) && s.model.map(|m| m == model_id).unwrap_or(true)
                })
                .and_then(|s| {
                    if s.responses.len() > 1 {
                        s.responses.pop_front()
                    } else {
                        s.responses.front().cloned()
                    }
                })
        };

        match scripted {
            Some(Scripted::Reply(text)) => Ok(AnalyzeOutput {
                text,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    estimated: false,
                },
            }),
            Some(Scripted::TransportError(message)) => Err(anyhow!(message)),
            Some(Scripted::Panic) => panic!("scripted provider panic"),
            None => Err(anyhow!("no scripted response for model {}", model_id)),
        }
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_retries: 1,
        ..EngineConfig::default()
    }
}

pub async fn context(
    provider: Arc<MockProvider>,
    config: EngineConfig,
) -> (tempfile::TempDir, Arc<PipelineContext>) {
    let dir = tempfile::tempdir().unwrap();
    let store = CaseStore::open(dir.path().join("pipeline_test.db"))
        .await
        .unwrap();
    let bus = Arc::new(EventBus::new(
        config.event_buffer_capacity,
        config.subscriber_queue_capacity,
    ));
    let gate = Arc::new(ConfirmationGate::new(bus.clone()));
    let ctx = Arc::new(PipelineContext {
        store,
        provider,
        bus,
        gate,
        config,
    });
    (dir, ctx)
}

/// Create a pending case with the given evidence files. Returns the case id
/// and the file ids in insertion order.
pub async fn seed_case(ctx: &PipelineContext, files: &[&str]) -> (String, Vec<String>) {
    let case = ctx.store.create_case("pending").await.unwrap();
    let mut file_ids = Vec::new();
    for name in files {
        let file = ctx.store.add_case_file(&case.case_id, name).await.unwrap();
        file_ids.push(file.file_id);
    }
    (case.case_id, file_ids)
}
