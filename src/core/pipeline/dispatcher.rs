//! Fans planned tasks out as independent tokio tasks, each with its own
//! store connection, and fans results back in. A task's panic or failure
//! never aborts siblings, and every planned task appears in the result map
//! exactly once — missing results are back-filled as explicit failures,
//! since a silently absent task is indistinguishable from one that was
//! never scheduled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::core::config::EngineConfig;
use crate::core::events::EventBus;
use crate::core::llm::AnalysisProvider;
use crate::core::store::CaseStore;

use super::executor::{AnalystRequest, run_analyst};
use super::types::{AgentTask, AnalystKind};

/// Per-analyst results: the structured output (or `None` on failure) plus
/// the group label the task was planned under.
pub type DispatchResults = HashMap<AnalystKind, Vec<(Option<Value>, String)>>;

/// Instructions handed to a domain analyst. The exact wording is
/// deliberately minimal; prompt engineering lives outside this crate.
pub(crate) fn analyst_instructions(kind: AnalystKind) -> &'static str {
    match kind {
        AnalystKind::Financial => {
            "You are a financial evidence analyst. Extract transactions, accounts, amounts, and monetary relationships from the evidence. Output ONLY valid JSON with `findings`, `entities`, and `relationships` arrays."
        }
        AnalystKind::Legal => {
            "You are a legal evidence analyst. Extract parties, obligations, contracts, and legal references from the evidence. Output ONLY valid JSON with `findings`, `entities`, and `relationships` arrays."
        }
        AnalystKind::Communications => {
            "You are a communications analyst. Extract senders, recipients, threads, and notable exchanges from the evidence. Output ONLY valid JSON with `findings`, `entities`, and `relationships` arrays."
        }
        AnalystKind::Timeline => {
            "You are a timeline analyst. Extract dated events and their ordering from the evidence. Output ONLY valid JSON with `findings`, `entities`, and `relationships` arrays."
        }
        AnalystKind::Triage => {
            "You are a triage analyst. Classify each evidence file and assess its relevance. Output ONLY valid JSON."
        }
        AnalystKind::Routing => {
            "You are a routing analyst. Assign evidence files to domain analysts, grouping related files. Output ONLY valid JSON with `groups` and `per_file` arrays."
        }
        AnalystKind::Synthesis => {
            "You are a synthesis analyst. Combine the domain analysts' findings into a coherent case summary. Output ONLY valid JSON."
        }
    }
}

/// Build the user payload for one task: the files in scope and any shared
/// context the routing analyst attached to the group.
pub(crate) fn build_task_payload(
    task: &AgentTask,
    file_names: &HashMap<String, String>,
) -> String {
    let mut parts = Vec::new();
    parts.push(format!(
        "# Evidence files ({} in scope)\n",
        task.file_ids.len()
    ));
    for file_id in &task.file_ids {
        let name = file_names
            .get(file_id)
            .map(|n| n.as_str())
            .unwrap_or("<unknown>");
        parts.push(format!("- {} ({})", name, file_id));
    }
    if let Some(ref context) = task.shared_context {
        parts.push(format!("\n# Shared context\n{}", context));
    }
    parts.join("\n")
}

/// Run every planned task concurrently and collect all results.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    store: &CaseStore,
    provider: Arc<dyn AnalysisProvider>,
    bus: Arc<EventBus>,
    config: &EngineConfig,
    case_id: &str,
    workflow_id: &str,
    tasks: Vec<AgentTask>,
    file_names: &HashMap<String, String>,
) -> DispatchResults {
    let planned: Vec<(AnalystKind, String)> = tasks
        .iter()
        .map(|t| (t.analyst, t.group_label.clone()))
        .collect();

    let mut set: JoinSet<(usize, Option<Value>)> = JoinSet::new();
    let mut results: DispatchResults = HashMap::new();
    let mut delivered: HashSet<usize> = HashSet::new();

    for (index, task) in tasks.into_iter().enumerate() {
        // Isolated resource handle per task: a failing task cannot poison a
        // sibling's connection state.
        let task_store = match store.open_isolated().await {
            Ok(s) => s,
            Err(e) => {
                error!(
                    "Could not open store connection for task [{}/{}]: {}",
                    task.analyst.as_str(),
                    task.group_label,
                    e
                );
                delivered.insert(index);
                results
                    .entry(task.analyst)
                    .or_default()
                    .push((None, task.group_label));
                continue;
            }
        };

        let request = AnalystRequest {
            case_id: case_id.to_string(),
            workflow_id: workflow_id.to_string(),
            analyst: task.analyst,
            analyst_name: format!("{}:{}", task.analyst.as_str(), task.group_label),
            parent_execution_id: None,
            system_prompt: analyst_instructions(task.analyst).to_string(),
            user_payload: build_task_payload(&task, file_names),
        };

        let provider = provider.clone();
        let bus = bus.clone();
        let config = config.clone();
        set.spawn(async move {
            let output = run_analyst(&task_store, provider, bus, &config, &request).await;
            (index, output)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, output)) => {
                let (analyst, label) = planned[index].clone();
                delivered.insert(index);
                results.entry(analyst).or_default().push((output, label));
            }
            Err(e) => {
                // A panicking task is isolated here; its entry is back-filled
                // below from the planned list.
                error!("Dispatched task panicked: {}", e);
            }
        }
    }

    // Completeness: every planned task shows up exactly once, tracked by
    // position so tasks sharing an (analyst, label) pair stay distinct.
    for (index, (analyst, label)) in planned.into_iter().enumerate() {
        if !delivered.contains(&index) {
            warn!(
                "Back-filling missing result for task [{}/{}]",
                analyst.as_str(),
                label
            );
            results.entry(analyst).or_default().push((None, label));
        }
    }

    results
}
