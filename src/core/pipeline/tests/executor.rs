use std::sync::Arc;

use serde_json::json;

use crate::core::events::EventBus;
use crate::core::pipeline::types::AnalystKind;
use crate::core::pipeline::{AnalystRequest, run_analyst};
use crate::core::store::CaseStore;

use super::support::{MockProvider, Scripted, context, seed_case, test_config};

fn request(case_id: &str) -> AnalystRequest {
    AnalystRequest {
        case_id: case_id.to_string(),
        workflow_id: "wf-1".to_string(),
        analyst: AnalystKind::Financial,
        analyst_name: "financial:grp_0".to_string(),
        parent_execution_id: None,
        system_prompt: "You are a financial evidence analyst.".to_string(),
        user_payload: "# Evidence files\n- ledger.xlsx".to_string(),
    }
}

#[tokio::test]
async fn success_records_completed_execution() {
    let provider = Arc::new(MockProvider::new());
    provider.reply("financial", json!({ "findings": [], "entities": [], "relationships": [] }));
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &["ledger.xlsx"]).await;

    let output = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &request(&case_id),
    )
    .await;

    assert!(output.is_some());
    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    let row = &executions[0];
    assert_eq!(row.status, "completed");
    assert_eq!(row.model, "gpt-4o");
    assert_eq!(row.input_tokens, 10);
    assert_eq!(row.output_tokens, 5);
    assert_eq!(provider.call_count("gpt-4o", "financial"), 1);

    // Single-row lookup agrees with the listing.
    let fetched = ctx
        .store
        .get_execution(&row.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.status, "completed");
    assert!(fetched.output_json.is_some());
}

#[tokio::test]
async fn transport_error_is_retried_on_the_same_tier() {
    let provider = Arc::new(MockProvider::new());
    provider.script(
        "financial",
        vec![
            Scripted::TransportError("connection reset".into()),
            Scripted::Reply(json!({ "findings": [] }).to_string()),
        ],
    );
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &["ledger.xlsx"]).await;

    let output = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &request(&case_id),
    )
    .await;

    assert!(output.is_some());
    assert_eq!(provider.call_count("gpt-4o", "financial"), 2);
    assert_eq!(provider.call_count("gpt-4o-mini", "financial"), 0);

    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    assert_eq!(executions[0].status, "completed");
    assert_eq!(executions[0].model, "gpt-4o");
}

#[tokio::test]
async fn malformed_output_is_retried_like_a_failure() {
    let provider = Arc::new(MockProvider::new());
    provider.script(
        "financial",
        vec![
            Scripted::Reply("I could not produce structured output, sorry.".into()),
            Scripted::Reply(json!({ "findings": [] }).to_string()),
        ],
    );
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &["ledger.xlsx"]).await;

    let output = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &request(&case_id),
    )
    .await;

    assert!(output.is_some());
    assert_eq!(provider.call_count("gpt-4o", "financial"), 2);
    // Both attempts returned text, so both burned tokens.
    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    assert_eq!(executions[0].input_tokens, 20);
    assert_eq!(executions[0].output_tokens, 10);
}

#[tokio::test]
async fn falls_back_after_primary_tier_is_exhausted() {
    let provider = Arc::new(MockProvider::new());
    provider.script_for_model(
        "financial",
        Some("gpt-4o"),
        vec![Scripted::Reply("still not json".into())],
    );
    provider.script_for_model(
        "financial",
        Some("gpt-4o-mini"),
        vec![Scripted::Reply(json!({ "findings": ["wire transfer"] }).to_string())],
    );
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &["ledger.xlsx"]).await;

    let output = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &request(&case_id),
    )
    .await
    .unwrap();

    // max_retries = 1: two primary attempts, then the fallback succeeded.
    assert_eq!(provider.call_count("gpt-4o", "financial"), 2);
    assert_eq!(provider.call_count("gpt-4o-mini", "financial"), 1);
    assert_eq!(output["derived_via_fallback"], json!(true));
    assert_eq!(output["findings"], json!(["wire transfer"]));

    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    let row = &executions[0];
    assert_eq!(row.status, "completed");
    assert_eq!(row.model, "gpt-4o-mini");
    // Tokens accumulate across all three attempts.
    assert_eq!(row.input_tokens, 30);
    assert_eq!(row.output_tokens, 15);

    let mut rx = ctx.bus.subscribe(&case_id, &[]);
    let mut saw_fallback_warning = false;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == "fallback_warning" {
            saw_fallback_warning = true;
        }
    }
    assert!(saw_fallback_warning);
}

#[tokio::test]
async fn exhausting_both_tiers_returns_none_and_fails_the_row() {
    let provider = Arc::new(MockProvider::new());
    provider.script(
        "financial",
        vec![Scripted::TransportError("model unavailable".into())],
    );
    let (_dir, ctx) = context(provider.clone(), test_config()).await;
    let (case_id, _) = seed_case(&ctx, &["ledger.xlsx"]).await;

    let output = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &request(&case_id),
    )
    .await;

    assert!(output.is_none());
    assert_eq!(provider.call_count("gpt-4o", "financial"), 2);
    assert_eq!(provider.call_count("gpt-4o-mini", "financial"), 2);

    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    let row = &executions[0];
    assert_eq!(row.status, "failed");
    assert!(row.error.as_deref().unwrap().contains("model unavailable"));

    let mut rx = ctx.bus.subscribe(&case_id, &[]);
    let mut saw_failed = false;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == "analyst_failed" {
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn store_error_after_the_attempts_still_lands_a_terminal_row() {
    let provider = Arc::new(MockProvider::new());
    provider.reply("financial", json!({ "findings": [] }));

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("executor_test.db");
    let store = CaseStore::open(&db_path).await.unwrap();
    let case = store.create_case("pending").await.unwrap();
    store.add_case_file(&case.case_id, "ledger.xlsx").await.unwrap();

    // Completion writes hit a database error; failure writes still work.
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_completed_writes
             BEFORE UPDATE ON agent_executions
             WHEN NEW.status = 'completed'
             BEGIN SELECT RAISE(ABORT, 'simulated write failure'); END;",
        )
        .unwrap();
    }

    let bus = Arc::new(EventBus::new(32, 32));
    let output = run_analyst(
        &store,
        provider.clone(),
        bus.clone(),
        &test_config(),
        &request(&case.case_id),
    )
    .await;

    // The analyst itself succeeded, but the ledger write did not.
    assert!(output.is_none());
    assert_eq!(provider.call_count("gpt-4o", "financial"), 1);

    let executions = store.list_executions_for_case(&case.case_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, "failed");
    assert!(
        executions[0]
            .error
            .as_deref()
            .unwrap()
            .contains("simulated write failure")
    );

    let mut rx = bus.subscribe(&case.case_id, &[]);
    let mut saw_failed = false;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == "analyst_failed" {
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn oversized_output_is_truncated_before_persisting() {
    let provider = Arc::new(MockProvider::new());
    let finding = "a".repeat(500);
    provider.reply("financial", json!({ "findings": [finding.clone()] }));

    let mut config = test_config();
    config.output_truncate_limit = 64;
    let (_dir, ctx) = context(provider.clone(), config).await;
    let (case_id, _) = seed_case(&ctx, &["ledger.xlsx"]).await;

    let output = run_analyst(
        &ctx.store,
        ctx.provider.clone(),
        ctx.bus.clone(),
        &ctx.config,
        &request(&case_id),
    )
    .await
    .unwrap();

    // Callers get the full value; only the persisted copy is clipped.
    assert_eq!(output["findings"], json!([finding]));

    let executions = ctx.store.list_executions_for_case(&case_id).await.unwrap();
    let row = &executions[0];
    assert_eq!(row.status, "completed");
    let stored = row.output_json.as_deref().unwrap();
    assert!(stored.len() <= 64 + "...".len());
    assert!(stored.ends_with("..."));
}
