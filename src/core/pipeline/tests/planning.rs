use std::collections::HashSet;

use crate::core::pipeline::planner::{coverage, plan_tasks};
use crate::core::pipeline::types::{AnalystKind, FileGroup, FileRouting, RoutingDecision};

fn files(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("file-{}", i)).collect()
}

fn routing_with_group_and_per_file() -> RoutingDecision {
    RoutingDecision {
        groups: vec![FileGroup {
            file_ids: vec!["file-0".into(), "file-1".into()],
            analysts: vec![AnalystKind::Financial, AnalystKind::Legal],
            shared_context: Some("related invoices".into()),
        }],
        per_file: vec![
            // Already covered through the group: must not produce a task.
            FileRouting {
                file_id: "file-0".into(),
                analysts: vec![AnalystKind::Financial],
            },
            FileRouting {
                file_id: "file-2".into(),
                analysts: vec![AnalystKind::Timeline, AnalystKind::Timeline],
            },
        ],
    }
}

#[test]
fn planning_is_deterministic() {
    let routing = routing_with_group_and_per_file();
    let file_ids = files(3);
    assert_eq!(
        plan_tasks(&routing, &file_ids),
        plan_tasks(&routing, &file_ids)
    );
}

#[test]
fn no_duplicate_file_analyst_coverage() {
    let routing = routing_with_group_and_per_file();
    let tasks = plan_tasks(&routing, &files(3));
    let pairs = coverage(&tasks);
    let unique: HashSet<_> = pairs.iter().cloned().collect();
    assert_eq!(pairs.len(), unique.len());
}

#[test]
fn group_assignment_beats_per_file() {
    let routing = routing_with_group_and_per_file();
    let tasks = plan_tasks(&routing, &files(3));

    let financial_tasks: Vec<_> = tasks
        .iter()
        .filter(|t| t.analyst == AnalystKind::Financial)
        .collect();
    assert_eq!(financial_tasks.len(), 1);
    assert_eq!(financial_tasks[0].group_label, "grp_0");
    assert_eq!(financial_tasks[0].file_ids.len(), 2);
}

#[test]
fn repeated_per_file_analyst_collapses_to_one_task() {
    let routing = routing_with_group_and_per_file();
    let tasks = plan_tasks(&routing, &files(3));
    let timeline_tasks: Vec<_> = tasks
        .iter()
        .filter(|t| t.analyst == AnalystKind::Timeline)
        .collect();
    assert_eq!(timeline_tasks.len(), 1);
    assert_eq!(timeline_tasks[0].file_ids, vec!["file-2".to_string()]);
    assert_eq!(timeline_tasks[0].group_label, "ungrouped_0");
}

#[test]
fn unknown_files_are_ignored() {
    let routing = RoutingDecision {
        groups: vec![FileGroup {
            file_ids: vec!["file-0".into(), "ghost".into()],
            analysts: vec![AnalystKind::Legal],
            shared_context: None,
        }],
        per_file: vec![FileRouting {
            file_id: "phantom".into(),
            analysts: vec![AnalystKind::Financial],
        }],
    };
    let tasks = plan_tasks(&routing, &files(1));
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].file_ids, vec!["file-0".to_string()]);
}

#[test]
fn group_of_only_unknown_files_produces_nothing() {
    let routing = RoutingDecision {
        groups: vec![FileGroup {
            file_ids: vec!["ghost".into()],
            analysts: vec![AnalystKind::Financial],
            shared_context: None,
        }],
        per_file: vec![],
    };
    assert!(plan_tasks(&routing, &files(2)).is_empty());
}

#[test]
fn non_domain_analysts_never_get_tasks() {
    let routing = RoutingDecision {
        groups: vec![FileGroup {
            file_ids: vec!["file-0".into()],
            analysts: vec![AnalystKind::Triage, AnalystKind::Synthesis, AnalystKind::Legal],
            shared_context: None,
        }],
        per_file: vec![FileRouting {
            file_id: "file-1".into(),
            analysts: vec![AnalystKind::Routing],
        }],
    };
    let tasks = plan_tasks(&routing, &files(2));
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].analyst, AnalystKind::Legal);
}

#[test]
fn empty_routing_plans_nothing() {
    assert!(plan_tasks(&RoutingDecision::default(), &files(4)).is_empty());
}

#[test]
fn ungrouped_labels_follow_file_order() {
    let routing = RoutingDecision {
        groups: vec![],
        per_file: vec![
            FileRouting {
                file_id: "file-2".into(),
                analysts: vec![AnalystKind::Legal],
            },
            FileRouting {
                file_id: "file-0".into(),
                analysts: vec![AnalystKind::Financial],
            },
        ],
    };
    let tasks = plan_tasks(&routing, &files(3));
    // Labels are positional over the file set, not over routing order.
    let by_file: Vec<(String, String)> = tasks
        .iter()
        .map(|t| (t.file_ids[0].clone(), t.group_label.clone()))
        .collect();
    assert!(by_file.contains(&("file-0".to_string(), "ungrouped_0".to_string())));
    assert!(by_file.contains(&("file-2".to_string(), "ungrouped_1".to_string())));
}
