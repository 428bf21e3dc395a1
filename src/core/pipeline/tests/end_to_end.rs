use std::sync::Arc;

use serde_json::json;

use crate::core::confirm::Decision;
use crate::core::pipeline::types::PipelineStage;
use crate::core::pipeline::{infer_stage, run_case};

use super::support::{MockProvider, Scripted, context, seed_case, test_config};

#[tokio::test]
async fn full_case_merges_duplicate_entities_across_analysts() {
    let provider = Arc::new(MockProvider::new());
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, file_ids) = seed_case(&ctx, &["ledger.xlsx", "contract.pdf"]).await;

    provider.reply(
        "triage",
        json!({ "files": [{ "file_id": file_ids[0], "relevance": "high" }] }),
    );
    provider.reply(
        "routing",
        json!({
            "groups": [{
                "file_ids": [file_ids[0], file_ids[1]],
                "analysts": ["financial", "legal"],
                "shared_context": "vendor dispute",
            }],
            "per_file": [],
        }),
    );
    provider.reply(
        "financial evidence",
        json!({
            "findings": ["recurring payments to Acme Corp"],
            "entities": [
                { "name": "Acme Corp", "type": "organization", "confidence": 90 },
                { "name": "Dana Reyes", "type": "person", "confidence": 85 }
            ],
            "relationships": [
                { "source": "Dana Reyes", "target": "Acme Corp", "type": "paid", "strength": 70 }
            ],
        }),
    );
    provider.reply(
        "legal evidence",
        json!({
            "findings": ["contract names acme corp. as counterparty"],
            "entities": [
                { "name": "acme corp.", "type": "organization", "confidence": 88 }
            ],
            "relationships": [],
        }),
    );
    provider.reply("synthesis", json!({ "summary": "vendor dispute with Acme Corp" }));

    let subscriber = ctx.bus.subscribe(&case_id, &[]);

    let stage = run_case(&ctx, &case_id).await.unwrap();
    assert_eq!(stage, PipelineStage::Complete);

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.status, "complete");
    assert!(case.finished_at.is_some());

    // The two organization spellings collapsed into the earliest node.
    let active = ctx.store.list_active_entities(&case_id).await.unwrap();
    assert_eq!(active.len(), 2);
    let acme = active.iter().find(|e| e.name == "Acme Corp").unwrap();
    assert_eq!(acme.merge_count, 1);
    assert_eq!(acme.degree, 1);

    // The ledger alone reconstructs the terminal stage.
    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    assert_eq!(infer_stage(&executions), PipelineStage::Complete);
    let kinds: Vec<&str> = executions.iter().map(|e| e.analyst_kind.as_str()).collect();
    assert!(kinds.contains(&"triage"));
    assert!(kinds.contains(&"routing"));
    assert!(kinds.contains(&"financial"));
    assert!(kinds.contains(&"legal"));
    assert!(kinds.contains(&"synthesis"));
    assert!(executions.iter().all(|e| e.status == "completed"));

    for file in ctx.store.list_case_files(&case_id).await.unwrap() {
        assert_eq!(file.status, "analyzed");
    }

    // The subscriber saw the run live and the channel closed at the end.
    let mut rx = subscriber;
    let mut event_types = Vec::new();
    while let Some(event) = rx.recv().await {
        event_types.push(event.event_type);
    }
    assert!(event_types.iter().any(|t| t == "tasks_planned"));
    assert!(event_types.iter().any(|t| t == "graph_deduplicated"));
    assert!(event_types.iter().any(|t| t == "stage_changed"));
}

#[tokio::test]
async fn triage_failure_lands_the_case_in_error() {
    let provider = Arc::new(MockProvider::new());
    provider.script(
        "triage",
        vec![Scripted::TransportError("model unavailable".into())],
    );
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &["ledger.xlsx"]).await;

    let stage = run_case(&ctx, &case_id).await.unwrap();
    assert_eq!(stage, PipelineStage::Error);

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.status, "error");
    for file in ctx.store.list_case_files(&case_id).await.unwrap() {
        assert_eq!(file.status, "failed");
    }

    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    assert_eq!(infer_stage(&executions), PipelineStage::Error);
}

#[tokio::test]
async fn routing_with_no_usable_tasks_is_an_error() {
    let provider = Arc::new(MockProvider::new());
    provider.reply("triage", json!({ "files": [] }));
    provider.reply("routing", json!({ "groups": [], "per_file": [] }));
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &["mystery.bin"]).await;

    let stage = run_case(&ctx, &case_id).await.unwrap();
    assert_eq!(stage, PipelineStage::Error);
}

#[tokio::test]
async fn case_with_no_files_completes_empty() {
    let provider = Arc::new(MockProvider::new());
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &[]).await;

    let stage = run_case(&ctx, &case_id).await.unwrap();
    assert_eq!(stage, PipelineStage::Complete);
    assert_eq!(provider.call_count("gpt-4o", ""), 0);
}

#[tokio::test]
async fn rejected_low_confidence_entities_never_reach_the_graph() {
    let provider = Arc::new(MockProvider::new());
    let mut config = test_config();
    config.review_thresholds.insert("financial".to_string(), 80);
    let (_dir, ctx) = context(provider.clone(), config).await;
    let (case_id, file_ids) = seed_case(&ctx, &["ledger.xlsx"]).await;

    provider.reply("triage", json!({ "files": [] }));
    provider.reply(
        "routing",
        json!({
            "groups": [],
            "per_file": [{ "file_id": file_ids[0], "analysts": ["financial"] }],
        }),
    );
    provider.reply(
        "financial evidence",
        json!({
            "findings": [],
            "entities": [
                { "name": "Acme Corp", "type": "organization", "confidence": 90 },
                { "name": "Shadow LLC", "type": "organization", "confidence": 40 }
            ],
            "relationships": [],
        }),
    );
    provider.reply("synthesis", json!({ "summary": "done" }));

    let runner = {
        let ctx = ctx.clone();
        let case_id = case_id.clone();
        tokio::spawn(async move { run_case(&ctx, &case_id).await })
    };

    // The pipeline parks on the review gate; reject the flagged entity.
    let request_id = loop {
        if let Some(req) = ctx.gate.pending_requests().into_iter().next() {
            assert_eq!(req.items.len(), 1);
            assert!(req.items[0].contains("Shadow LLC"));
            break req.request_id;
        }
        tokio::task::yield_now().await;
    };
    assert!(ctx.gate.resolve_batch(
        &request_id,
        vec![Decision {
            approved: false,
            reason: Some("unverifiable".into()),
        }],
    ));

    let stage = runner.await.unwrap().unwrap();
    assert_eq!(stage, PipelineStage::Complete);

    let active = ctx.store.list_active_entities(&case_id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "Acme Corp");
}

#[tokio::test]
async fn approved_entities_survive_the_review_gate() {
    let provider = Arc::new(MockProvider::new());
    let mut config = test_config();
    config.review_thresholds.insert("financial".to_string(), 80);
    let (_dir, ctx) = context(provider.clone(), config).await;
    let (case_id, file_ids) = seed_case(&ctx, &["ledger.xlsx"]).await;

    provider.reply("triage", json!({ "files": [] }));
    provider.reply(
        "routing",
        json!({
            "groups": [],
            "per_file": [{ "file_id": file_ids[0], "analysts": ["financial"] }],
        }),
    );
    provider.reply(
        "financial evidence",
        json!({
            "findings": [],
            "entities": [
                { "name": "Shadow LLC", "type": "organization", "confidence": 40 }
            ],
            "relationships": [],
        }),
    );
    provider.reply("synthesis", json!({ "summary": "done" }));

    let runner = {
        let ctx = ctx.clone();
        let case_id = case_id.clone();
        tokio::spawn(async move { run_case(&ctx, &case_id).await })
    };

    let request_id = loop {
        if let Some(req) = ctx.gate.pending_requests().into_iter().next() {
            break req.request_id;
        }
        tokio::task::yield_now().await;
    };
    assert!(ctx.gate.resolve(&request_id, true, None));

    let stage = runner.await.unwrap().unwrap();
    assert_eq!(stage, PipelineStage::Complete);

    let active = ctx.store.list_active_entities(&case_id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "Shadow LLC");
}
