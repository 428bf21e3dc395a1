//! Routing decision → flat task list. Pure and deterministic: the
//! controller calls it twice, once to pre-announce expected tasks on the
//! event bus and once to drive execution, and both calls must agree.

use std::collections::HashSet;

use super::types::{AgentTask, AnalystKind, RoutingDecision};

/// Expand a routing decision into independent tasks with no duplicate
/// (file, analyst) coverage. Group assignments win: a file already covered
/// for an analyst through its group never gets a second per-file task for
/// that analyst. Files the routing decision names but the file set does not
/// contain are ignored.
pub fn plan_tasks(routing: &RoutingDecision, file_ids: &[String]) -> Vec<AgentTask> {
    let known: HashSet<&str> = file_ids.iter().map(|f| f.as_str()).collect();
    let mut covered: HashSet<(String, AnalystKind)> = HashSet::new();
    let mut tasks = Vec::new();

    for (idx, group) in routing.groups.iter().enumerate() {
        let group_files: Vec<String> = group
            .file_ids
            .iter()
            .filter(|f| known.contains(f.as_str()))
            .cloned()
            .collect();
        if group_files.is_empty() {
            continue;
        }
        for analyst in &group.analysts {
            if !analyst.is_domain() {
                continue;
            }
            for file_id in &group_files {
                covered.insert((file_id.clone(), *analyst));
            }
            tasks.push(AgentTask {
                analyst: *analyst,
                file_ids: group_files.clone(),
                shared_context: group.shared_context.clone(),
                group_label: format!("grp_{}", idx),
            });
        }
    }

    // Per-file assignments, label positional among files that still need at
    // least one task, in file-set order for stability.
    let mut ungrouped_index = 0usize;
    for file_id in file_ids {
        let routed: Vec<AnalystKind> = routing
            .per_file
            .iter()
            .filter(|r| &r.file_id == file_id)
            .flat_map(|r| r.analysts.iter().copied())
            .filter(|a| a.is_domain())
            .filter(|a| !covered.contains(&(file_id.clone(), *a)))
            .collect();
        if routed.is_empty() {
            continue;
        }
        let label = format!("ungrouped_{}", ungrouped_index);
        ungrouped_index += 1;
        let mut seen = HashSet::new();
        for analyst in routed {
            if !seen.insert(analyst) {
                continue;
            }
            covered.insert((file_id.clone(), analyst));
            tasks.push(AgentTask {
                analyst,
                file_ids: vec![file_id.clone()],
                shared_context: None,
                group_label: label.clone(),
            });
        }
    }

    tasks
}

/// All (file, analyst) pairs a task list claims. Used by the controller for
/// progress accounting and by tests for the no-duplicate-coverage property.
pub fn coverage(tasks: &[AgentTask]) -> Vec<(String, AnalystKind)> {
    let mut pairs = Vec::new();
    for task in tasks {
        for file_id in &task.file_ids {
            pairs.push((file_id.clone(), task.analyst));
        }
    }
    pairs
}
