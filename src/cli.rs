use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use console::style;

use crate::core::config::EngineConfig;
use crate::core::confirm::ConfirmationGate;
use crate::core::events::EventBus;
use crate::core::llm::openai::OpenAiCompatProvider;
use crate::core::pipeline::{PipelineContext, PipelineStage, infer_stage, run_case};
use crate::core::store::CaseStore;
use crate::core::terminal::{
    self, print_error, print_info, print_status, print_success, print_warn,
};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_DB: &str = "dossier.db";
const DEFAULT_CONFIG: &str = "dossier.toml";

fn print_help() {
    terminal::print_banner();

    println!(" {}", style("Commands").bold());
    println!("   {}  Analyze evidence files as a new case", style("run").green());
    println!("   {}  Show a case's stage and execution ledger", style("status").green());
    println!("   {}  Show a case's knowledge graph", style("graph").green());
    println!();
    println!(" {}", style("Options for run").bold());
    println!("   --file <name>      Evidence file to analyze (repeatable)");
    println!("   --db <path>        Database path (default: {})", DEFAULT_DB);
    println!("   --config <path>    Config file (default: {})", DEFAULT_CONFIG);
    println!("   --api-url <url>    Chat completions endpoint");
    println!("   --auto-approve     Approve review gates without prompting");
    println!();
    println!(
        " {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("dossier").green()
    );
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("run") => run_command(&args, 2).await,
        Some("status") => status_command(&args, 2).await,
        Some("graph") => graph_command(&args, 2).await,
        Some("help") | Some("--help") | Some("-h") | None => {
            print_help();
            Ok(())
        }
        Some(other) => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}

struct RunArgs {
    db: String,
    config: String,
    api_url: String,
    files: Vec<String>,
    auto_approve: bool,
}

fn parse_run_args(args: &[String], start: usize) -> RunArgs {
    let mut parsed = RunArgs {
        db: DEFAULT_DB.to_string(),
        config: DEFAULT_CONFIG.to_string(),
        api_url: DEFAULT_API_URL.to_string(),
        files: Vec::new(),
        auto_approve: false,
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--db" => {
                if i + 1 < args.len() {
                    parsed.db = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--config" => {
                if i + 1 < args.len() {
                    parsed.config = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-url" => {
                if i + 1 < args.len() {
                    parsed.api_url = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    parsed.files.push(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--auto-approve" => {
                parsed.auto_approve = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    parsed
}

/// Flags plus one positional case id, for the read-only commands.
fn parse_case_args(args: &[String], start: usize) -> (String, Option<String>) {
    let mut db = DEFAULT_DB.to_string();
    let mut case_id = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--db" => {
                if i + 1 < args.len() {
                    db = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                case_id = Some(other.to_string());
                i += 1;
            }
        }
    }
    (db, case_id)
}

async fn run_command(args: &[String], start: usize) -> Result<()> {
    let parsed = parse_run_args(args, start);
    if parsed.files.is_empty() {
        return Err(anyhow!("at least one --file is required"));
    }

    let api_key = std::env::var("DOSSIER_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .map_err(|_| anyhow!("set DOSSIER_API_KEY or OPENAI_API_KEY"))?;

    crate::logging::init(false);
    terminal::print_banner();

    let config = EngineConfig::load_or_default(&parsed.config);
    let store = CaseStore::open(&parsed.db).await?;
    let bus = Arc::new(EventBus::new(
        config.event_buffer_capacity,
        config.subscriber_queue_capacity,
    ));
    let gate = Arc::new(ConfirmationGate::new(bus.clone()));
    let provider = Arc::new(OpenAiCompatProvider::new("openai", parsed.api_url, api_key));

    let case = store.create_case("pending").await?;
    for name in &parsed.files {
        store.add_case_file(&case.case_id, name).await?;
    }
    print_status("Case", &case.case_id);
    print_status("Files", &parsed.files.len().to_string());

    let ctx = PipelineContext {
        store,
        provider,
        bus,
        gate: gate.clone(),
        config,
    };
    let resolver = spawn_confirmation_resolver(gate, parsed.auto_approve);
    terminal::print_step("Running case pipeline");
    let stage = run_case(&ctx, &case.case_id).await?;
    resolver.abort();

    let entities = ctx.store.list_active_entities(&case.case_id).await?;
    let relationships = ctx.store.list_relationships(&case.case_id).await?;
    print_status("Entities", &entities.len().to_string());
    print_status("Relationships", &relationships.len().to_string());

    match stage {
        PipelineStage::Complete => {
            print_success("Case analysis complete");
            Ok(())
        }
        other => Err(anyhow!("case ended in stage {}", other.as_str())),
    }
}

/// Watches the confirmation gate and supplies decisions, either from the
/// terminal or automatically when --auto-approve is set. Aborted once the
/// pipeline finishes.
fn spawn_confirmation_resolver(
    gate: Arc<ConfirmationGate>,
    auto_approve: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for request in gate.pending_requests() {
                if auto_approve {
                    print_warn(&format!("Auto-approving: {}", request.description));
                    gate.resolve(&request.request_id, true, Some("auto-approved".into()));
                    continue;
                }
                println!(
                    "\n{} {}",
                    style("Review required:").bold().yellow(),
                    request.description
                );
                for item in &request.items {
                    println!("   - {}", item);
                }
                let approved = tokio::task::spawn_blocking(|| {
                    use std::io::Write;
                    print!("Approve all? [y/N] ");
                    let _ = std::io::stdout().flush();
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line).ok();
                    matches!(line.trim(), "y" | "Y" | "yes")
                })
                .await
                .unwrap_or(false);
                gate.resolve(&request.request_id, approved, None);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
}

async fn status_command(args: &[String], start: usize) -> Result<()> {
    let (db, case_id) = parse_case_args(args, start);
    let case_id = case_id.ok_or_else(|| anyhow!("usage: dossier status [--db <path>] <case_id>"))?;

    let store = CaseStore::open(&db).await?;
    let Some(case) = store.get_case(&case_id).await? else {
        return Err(anyhow!("no such case: {}", case_id));
    };

    let executions = store.list_executions_for_case(&case_id).await?;
    print_status("Case", &case.case_id);
    print_status("Status", &case.status);
    print_status("Stage (from ledger)", infer_stage(&executions).as_str());

    if executions.is_empty() {
        print_info("No executions recorded yet");
        return Ok(());
    }
    println!();
    for row in &executions {
        println!(
            "   {}  {}  {}  in/out tokens {}/{}",
            style(&row.analyst_name).bold(),
            style(&row.status).cyan(),
            row.model,
            row.input_tokens,
            row.output_tokens
        );
        if let Some(error) = &row.error {
            println!("      {}", style(error).red());
        }
    }
    Ok(())
}

async fn graph_command(args: &[String], start: usize) -> Result<()> {
    let (db, case_id) = parse_case_args(args, start);
    let case_id = case_id.ok_or_else(|| anyhow!("usage: dossier graph [--db <path>] <case_id>"))?;

    let store = CaseStore::open(&db).await?;
    if store.get_case(&case_id).await?.is_none() {
        return Err(anyhow!("no such case: {}", case_id));
    }

    let entities = store.list_active_entities(&case_id).await?;
    if entities.is_empty() {
        print_info("The knowledge graph is empty");
        return Ok(());
    }

    println!();
    for entity in &entities {
        let merged = if entity.merge_count > 0 {
            format!("  (+{} merged)", entity.merge_count)
        } else {
            String::new()
        };
        println!(
            "   {}  [{}]  degree {}  confidence {}{}",
            style(&entity.name).bold(),
            style(&entity.entity_type).cyan(),
            entity.degree,
            entity.confidence,
            style(&merged).dim()
        );
    }

    let relationships = store.list_relationships(&case_id).await?;
    if !relationships.is_empty() {
        println!();
        let by_id: std::collections::HashMap<&str, &str> = entities
            .iter()
            .map(|e| (e.entity_id.as_str(), e.name.as_str()))
            .collect();
        for rel in &relationships {
            let source = by_id.get(rel.source_id.as_str()).copied().unwrap_or("?");
            let target = by_id.get(rel.target_id.as_str()).copied().unwrap_or("?");
            println!(
                "   {} {} {}  (strength {})",
                source,
                style(&rel.label).dim(),
                target,
                rel.strength
            );
        }
    }
    Ok(())
}
