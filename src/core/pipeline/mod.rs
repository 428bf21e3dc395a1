//! Case pipeline controller. Drives one case through triage, routing,
//! parallel domain analysis, graph ingestion, synthesis, and the
//! deduplication barrier, persisting every step in the execution ledger
//! so the stage is always reconstructible after a crash.

mod dispatcher;
mod executor;
mod planner;
pub mod types;

#[cfg(test)]
mod tests;

pub use dispatcher::{DispatchResults, dispatch};
pub use executor::{AnalystRequest, run_analyst};
pub use planner::{coverage, plan_tasks};
pub use types::{AgentTask, AnalystKind, ExecutionStatus, PipelineStage, RoutingDecision};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::core::config::EngineConfig;
use crate::core::confirm::ConfirmationGate;
use crate::core::events::EventBus;
use crate::core::graph;
use crate::core::llm::AnalysisProvider;
use crate::core::store::CaseStore;
use crate::core::store::types::ExecutionRecord;

/// Legal stage transitions. Terminal stages accept nothing; every
/// non-terminal stage may fail into Error.
pub fn can_transition(from: PipelineStage, to: PipelineStage) -> bool {
    use PipelineStage::*;
    match (from, to) {
        (Pending, Triage) => true,
        (Triage, Orchestrating) => true,
        (Orchestrating, DomainAnalysis) => true,
        (DomainAnalysis, Complete) => true,
        (Pending | Triage | Orchestrating | DomainAnalysis, Error) => true,
        _ => false,
    }
}

/// Reconstruct the pipeline stage from the execution ledger alone. The
/// ledger is the source of truth; the cases table status is a cache of
/// this function's answer.
pub fn infer_stage(records: &[ExecutionRecord]) -> PipelineStage {
    let latest = |kind: AnalystKind| {
        records
            .iter()
            .filter(|r| AnalystKind::from_name(&r.analyst_kind) == Some(kind))
            .next_back()
    };
    let status = |r: &ExecutionRecord| ExecutionStatus::from_status(&r.status);

    let Some(triage) = latest(AnalystKind::Triage) else {
        return PipelineStage::Pending;
    };
    match status(triage) {
        Some(ExecutionStatus::Failed) => return PipelineStage::Error,
        Some(ExecutionStatus::Completed) => {}
        _ => return PipelineStage::Triage,
    }

    let Some(routing) = latest(AnalystKind::Routing) else {
        return PipelineStage::Orchestrating;
    };
    match status(routing) {
        Some(ExecutionStatus::Failed) => return PipelineStage::Error,
        Some(ExecutionStatus::Completed) => {}
        _ => return PipelineStage::Orchestrating,
    }

    if let Some(synthesis) = latest(AnalystKind::Synthesis) {
        match status(synthesis) {
            Some(ExecutionStatus::Failed) => return PipelineStage::Error,
            Some(ExecutionStatus::Completed) => return PipelineStage::Complete,
            _ => {}
        }
    }

    PipelineStage::DomainAnalysis
}

/// Shared handles for one pipeline run.
pub struct PipelineContext {
    pub store: CaseStore,
    pub provider: Arc<dyn AnalysisProvider>,
    pub bus: Arc<EventBus>,
    pub gate: Arc<ConfirmationGate>,
    pub config: EngineConfig,
}

impl PipelineContext {
    async fn set_stage(&self, case_id: &str, from: PipelineStage, to: PipelineStage) {
        if !can_transition(from, to) {
            warn!(
                "Refusing illegal stage transition [{}] -> [{}] for case [{}]",
                from.as_str(),
                to.as_str(),
                case_id
            );
            return;
        }
        if let Err(e) = self.store.update_case_status(case_id, to.as_str()).await {
            warn!("Could not persist stage for case [{}]: {}", case_id, e);
        }
        self.bus.publish(
            case_id,
            "pipeline",
            "stage_changed",
            json!({ "from": from.as_str(), "to": to.as_str() }),
        );
    }
}

/// Run one case end to end. Always leaves the case in a terminal status:
/// any failure path, including a panic-adjacent error bubbling out of a
/// stage, lands the case in Error with its unfinished files swept failed.
pub async fn run_case(ctx: &PipelineContext, case_id: &str) -> Result<PipelineStage> {
    let outcome = run_case_inner(ctx, case_id).await;

    // Safety net: whatever happened above, the case must end terminal.
    if let Ok(Some(case)) = ctx.store.get_case(case_id).await {
        let terminal = matches!(
            PipelineStage::from_status(&case.status),
            Some(stage) if stage.is_terminal()
        );
        if !terminal {
            warn!(
                "Case [{}] left non-terminal ({}); forcing error",
                case_id, case.status
            );
            let _ = ctx.store.update_case_status(case_id, "error").await;
            let _ = ctx.store.mark_unfinished_files_failed(case_id).await;
        }
    }

    match &outcome {
        Ok(stage) => info!("Case [{}] finished in stage [{}]", case_id, stage.as_str()),
        Err(e) => error!("Case [{}] pipeline error: {}", case_id, e),
    }
    ctx.bus.remove_case(case_id);
    outcome
}

async fn run_case_inner(ctx: &PipelineContext, case_id: &str) -> Result<PipelineStage> {
    let workflow_id = uuid::Uuid::new_v4().to_string();
    let files = ctx.store.list_case_files(case_id).await?;
    if files.is_empty() {
        warn!("Case [{}] has no evidence files; completing empty", case_id);
        ctx.store.update_case_status(case_id, "complete").await?;
        return Ok(PipelineStage::Complete);
    }

    let file_ids: Vec<String> = files.iter().map(|f| f.file_id.clone()).collect();
    let file_names: HashMap<String, String> = files
        .iter()
        .map(|f| (f.file_id.clone(), f.name.clone()))
        .collect();
    let file_listing = files
        .iter()
        .map(|f| format!("- {} ({})", f.name, f.file_id))
        .collect::<Vec<_>>()
        .join("\n");

    // ── triage ──
    ctx.set_stage(case_id, PipelineStage::Pending, PipelineStage::Triage)
        .await;
    let triage_request = AnalystRequest {
        case_id: case_id.to_string(),
        workflow_id: workflow_id.clone(),
        analyst: AnalystKind::Triage,
        analyst_name: "triage".to_string(),
        parent_execution_id: None,
        system_prompt: dispatcher::analyst_instructions(AnalystKind::Triage).to_string(),
        user_payload: format!("# Evidence files\n{}", file_listing),
    };
    let Some(triage_output) = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &triage_request,
    )
    .await
    else {
        return fail_case(ctx, case_id, PipelineStage::Triage, "triage failed").await;
    };
    for file in &files {
        let _ = ctx.store.update_file_status(&file.file_id, "triaged").await;
    }

    // ── routing ──
    ctx.set_stage(case_id, PipelineStage::Triage, PipelineStage::Orchestrating)
        .await;
    let routing_request = AnalystRequest {
        case_id: case_id.to_string(),
        workflow_id: workflow_id.clone(),
        analyst: AnalystKind::Routing,
        analyst_name: "routing".to_string(),
        parent_execution_id: None,
        system_prompt: dispatcher::analyst_instructions(AnalystKind::Routing).to_string(),
        user_payload: format!(
            "# Evidence files\n{}\n\n# Triage assessment\n{}",
            file_listing, triage_output
        ),
    };
    let Some(routing_output) = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &routing_request,
    )
    .await
    else {
        return fail_case(ctx, case_id, PipelineStage::Orchestrating, "routing failed").await;
    };
    let routing: RoutingDecision = match serde_json::from_value(routing_output) {
        Ok(decision) => decision,
        Err(e) => {
            return fail_case(
                ctx,
                case_id,
                PipelineStage::Orchestrating,
                &format!("routing output did not parse: {}", e),
            )
            .await;
        }
    };

    // Planning is deterministic, so announcing and dispatching from two
    // separate calls is safe and keeps the announcement honest.
    let announced = plan_tasks(&routing, &file_ids);
    ctx.bus.publish(
        case_id,
        "pipeline",
        "tasks_planned",
        json!({
            "workflow_id": workflow_id,
            "tasks": announced
                .iter()
                .map(|t| json!({
                    "analyst": t.analyst.as_str(),
                    "label": t.group_label,
                    "files": t.file_ids,
                }))
                .collect::<Vec<_>>(),
        }),
    );
    if announced.is_empty() {
        return fail_case(
            ctx,
            case_id,
            PipelineStage::Orchestrating,
            "routing produced no analyzable tasks",
        )
        .await;
    }

    // ── parallel domain analysis ──
    ctx.set_stage(
        case_id,
        PipelineStage::Orchestrating,
        PipelineStage::DomainAnalysis,
    )
    .await;
    let tasks = plan_tasks(&routing, &file_ids);
    let results = dispatch(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        case_id,
        &workflow_id,
        tasks.clone(),
        &file_names,
    )
    .await;

    // Files covered by at least one successful task count as analyzed.
    let mut succeeded_labels: HashSet<(AnalystKind, &str)> = HashSet::new();
    for (analyst, entries) in &results {
        for (output, label) in entries {
            if output.is_some() {
                succeeded_labels.insert((*analyst, label.as_str()));
            }
        }
    }
    let mut analyzed_files: HashSet<&str> = HashSet::new();
    for task in &tasks {
        if succeeded_labels.contains(&(task.analyst, task.group_label.as_str())) {
            for file_id in &task.file_ids {
                analyzed_files.insert(file_id.as_str());
            }
        }
    }
    for file_id in &analyzed_files {
        let _ = ctx.store.update_file_status(file_id, "analyzed").await;
    }

    // ── review gate + graph ingestion ──
    let mut domain_outputs: Vec<(AnalystKind, Value)> = Vec::new();
    for (analyst, entries) in &results {
        for (output, _label) in entries {
            if let Some(output) = output {
                domain_outputs.push((*analyst, output.clone()));
            }
        }
    }
    domain_outputs.sort_by_key(|(analyst, _)| analyst.as_str());

    for (analyst, output) in &mut domain_outputs {
        if let Some(&threshold) = ctx.config.review_thresholds.get(analyst.as_str()) {
            let dropped =
                review_low_confidence_entities(ctx, case_id, *analyst, threshold, output).await?;
            if dropped > 0 {
                info!(
                    "Dropped {} rejected entities from [{}] for case [{}]",
                    dropped,
                    analyst.as_str(),
                    case_id
                );
            }
        }
        let report = graph::ingest_findings(&ctx.store, case_id, analyst.as_str(), output).await?;
        ctx.bus.publish(
            case_id,
            analyst.as_str(),
            "findings_ingested",
            json!({
                "entities_added": report.entities_added,
                "relationships_added": report.relationships_added,
                "skipped": report.skipped,
            }),
        );
    }

    // ── synthesis ──
    let synthesis_payload = json!({
        "domain_findings": domain_outputs
            .iter()
            .map(|(analyst, output)| json!({
                "analyst": analyst.as_str(),
                "output": output,
            }))
            .collect::<Vec<_>>(),
    });
    let synthesis_request = AnalystRequest {
        case_id: case_id.to_string(),
        workflow_id: workflow_id.clone(),
        analyst: AnalystKind::Synthesis,
        analyst_name: "synthesis".to_string(),
        parent_execution_id: None,
        system_prompt: dispatcher::analyst_instructions(AnalystKind::Synthesis).to_string(),
        user_payload: synthesis_payload.to_string(),
    };
    let synthesis = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &synthesis_request,
    )
    .await;
    if synthesis.is_none() {
        return fail_case(ctx, case_id, PipelineStage::DomainAnalysis, "synthesis failed").await;
    }

    // ── deduplication barrier ──
    // Runs strictly after every ingest has committed; a merge racing a
    // late ingest could orphan edges.
    let report = graph::deduplicate(&ctx.store, case_id, ctx.config.fuzzy_threshold).await?;
    let recounted = graph::compute_degrees(&ctx.store, case_id).await?;
    ctx.bus.publish(
        case_id,
        "graph",
        "graph_deduplicated",
        json!({
            "exact_merges": report.exact_merges.len(),
            "fuzzy_flags": report
                .fuzzy_flags
                .iter()
                .map(|f| json!({
                    "entity_a": f.entity_a,
                    "entity_b": f.entity_b,
                    "score": f.score,
                }))
                .collect::<Vec<_>>(),
            "entities_recounted": recounted,
        }),
    );

    // ── complete ──
    let failed_files = ctx.store.mark_unfinished_files_failed(case_id).await?;
    if failed_files > 0 {
        warn!(
            "Case [{}] completed with {} unanalyzed files",
            case_id, failed_files
        );
    }
    ctx.set_stage(case_id, PipelineStage::DomainAnalysis, PipelineStage::Complete)
        .await;
    Ok(PipelineStage::Complete)
}

async fn fail_case(
    ctx: &PipelineContext,
    case_id: &str,
    from: PipelineStage,
    reason: &str,
) -> Result<PipelineStage> {
    error!("Case [{}] failed during [{}]: {}", case_id, from.as_str(), reason);
    ctx.set_stage(case_id, from, PipelineStage::Error).await;
    ctx.store.mark_unfinished_files_failed(case_id).await?;
    ctx.bus.publish(
        case_id,
        "pipeline",
        "case_failed",
        json!({ "stage": from.as_str(), "reason": reason }),
    );
    Ok(PipelineStage::Error)
}

/// Hold extracted entities below the analyst's review threshold for human
/// confirmation. Rejected entities are removed before ingestion, which also
/// drops any relationship that can no longer resolve its endpoint. Returns
/// the number of entities removed.
async fn review_low_confidence_entities(
    ctx: &PipelineContext,
    case_id: &str,
    analyst: AnalystKind,
    threshold: u8,
    output: &mut Value,
) -> Result<usize> {
    let Some(entities) = output.get("entities").and_then(|v| v.as_array()) else {
        return Ok(0);
    };

    let mut flagged_indexes = Vec::new();
    let mut items = Vec::new();
    for (idx, entity) in entities.iter().enumerate() {
        let confidence = entity.get("confidence").and_then(|v| v.as_i64()).unwrap_or(50);
        if confidence < threshold as i64 {
            let name = entity.get("name").and_then(|v| v.as_str()).unwrap_or("<unnamed>");
            flagged_indexes.push(idx);
            items.push(format!("{} (confidence {})", name, confidence));
        }
    }
    if flagged_indexes.is_empty() {
        return Ok(0);
    }

    let decisions = ctx
        .gate
        .request_batch(
            case_id,
            analyst.as_str(),
            &format!(
                "{} low-confidence entities from the {} analyst need review",
                flagged_indexes.len(),
                analyst.as_str()
            ),
            items,
        )
        .await?;
    if decisions.len() != flagged_indexes.len() {
        return Err(anyhow!("confirmation gate returned a mismatched decision count"));
    }

    let rejected: HashSet<usize> = flagged_indexes
        .into_iter()
        .zip(&decisions)
        .filter(|(_, d)| !d.approved)
        .map(|(idx, _)| idx)
        .collect();
    if rejected.is_empty() {
        return Ok(0);
    }

    let entities = output
        .get_mut("entities")
        .and_then(|v| v.as_array_mut())
        .ok_or_else(|| anyhow!("entities array vanished during review"))?;
    let mut idx = 0usize;
    entities.retain(|_| {
        let keep = !rejected.contains(&idx);
        idx += 1;
        keep
    });
    Ok(rejected.len())
}
