use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use query_pilot::{
    EngineConfig, GeminiClient, GeminiClientConfig, GeminiExecutor, GeminiFormatter, GeminiOracle,
    GeminiPlanner, GeminiPricingHandler, Guardrails, LlmClient, OrchestratorOptions, PromptStore,
    QueryOrchestrator, QueryOutcome, RequestLog, StageSet,
};

/// Query-Pilot CLI: natural-language data questions answered through an
/// LLM-orchestrated planning/execution/formatting pipeline
#[derive(Parser, Debug)]
#[command(name = "query-pilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a single question and exit
    #[command(name = "ask")]
    Ask {
        #[command(flatten)]
        args: AskArgs,
    },

    /// Interactive chat that can answer clarification follow-ups
    #[command(name = "chat")]
    Chat {
        #[command(flatten)]
        args: ChatArgs,
    },
}

#[derive(Parser, Debug)]
struct AskArgs {
    /// The question to answer
    #[arg(short, long)]
    query: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct ChatArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct CommonArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the schema context file
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Directory with prompt template overrides
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Ask { args }) => handle_ask_command(args).await,
        Some(Command::Chat { args }) => handle_chat_command(args).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!("Example: query-pilot ask --query \"How many customers signed up in May?\"");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// A wired-up engine plus its audit log.
struct Session {
    engine: QueryOrchestrator,
    audit: RequestLog,
}

async fn build_session(common: &CommonArgs) -> Result<Session> {
    let mut config = EngineConfig::load_or_default(common.config.as_ref())?;

    // Apply CLI overrides
    if let Some(schema) = &common.schema {
        config.context.schema_file = schema.clone();
    }
    if let Some(prompts) = &common.prompts {
        config.context.prompts_dir = Some(prompts.clone());
    }

    let api_key = std::env::var("GEMINI_API_KEY")
        .context("GEMINI_API_KEY environment variable is not set")?;

    let schema_context = std::fs::read_to_string(&config.context.schema_file).context(format!(
        "Failed to read schema context file: {:?}",
        config.context.schema_file
    ))?;

    let client: Arc<dyn LlmClient> = Arc::new(GeminiClient::new(GeminiClientConfig {
        api_key,
        ..GeminiClientConfig::default()
    })?);
    let prompts = Arc::new(PromptStore::new(config.context.prompts_dir.as_deref())?);

    let oracle = Arc::new(GeminiOracle::new(
        Arc::clone(&client),
        Arc::clone(&prompts),
        config.models.orchestration.as_str(),
    ));

    let stages = StageSet {
        planner: Arc::new(GeminiPlanner::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            config.models.planner.as_str(),
            schema_context.as_str(),
        )),
        executor: Arc::new(GeminiExecutor::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            config.models.executor.as_str(),
            schema_context.as_str(),
            None,
        )),
        formatter: Arc::new(GeminiFormatter::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            config.models.formatter.as_str(),
        )),
        handler: Arc::new(GeminiPricingHandler::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            config.models.pricing.as_str(),
        )),
    };

    let options = OrchestratorOptions {
        guardrails: Guardrails::from_config(&config.limits),
        history_window: config.context.history_window,
    };
    let engine = QueryOrchestrator::new(oracle, stages, options);
    let audit = RequestLog::create(&config.logs.dir).await?;

    Ok(Session { engine, audit })
}

async fn run_query(session: &Session, query: &str) -> QueryOutcome {
    let request_id = session.audit.start_request(query).await;
    let outcome = session.engine.handle_query(query).await;
    session.audit.log_outcome(&request_id, &outcome).await;
    outcome
}

async fn run_resume(session: &Session, key: &str, answer: &str) -> QueryOutcome {
    let request_id = session.audit.start_request(answer).await;
    let outcome = session.engine.resume_clarification(key, answer).await;
    session.audit.log_outcome(&request_id, &outcome).await;
    outcome
}

/// Print an outcome and return the clarification key when an answer is owed.
fn print_outcome(outcome: &QueryOutcome) -> Option<String> {
    if let Some(pending) = &outcome.metadata.clarification {
        println!("\n{}", outcome.display_text);
        println!(
            "(clarification round {}/{})",
            pending.round, pending.max_rounds
        );
        return Some(pending.key.clone());
    }

    println!("\n{}", outcome.display_text);
    if let Some(artifact) = &outcome.artifact {
        println!("\nSQL:\n{}", artifact);
    }
    None
}

async fn handle_ask_command(args: AskArgs) -> Result<()> {
    init_logging(args.common.verbose);
    info!("Query-Pilot starting");

    let session = build_session(&args.common).await?;
    let outcome = run_query(&session, &args.query).await;
    let pending = print_outcome(&outcome);

    if pending.is_some() {
        eprintln!("\nRun `query-pilot chat` to answer clarification questions interactively.");
        return Ok(());
    }
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_chat_command(args: ChatArgs) -> Result<()> {
    init_logging(args.common.verbose);
    info!("Query-Pilot chat starting");

    let session = build_session(&args.common).await?;
    let mut editor = DefaultEditor::new().context("Failed to initialize interactive editor")?;

    println!("Query-Pilot interactive chat");
    println!("Type a question, or 'exit' to quit.");

    // Key of the clarification thread awaiting the next line, if any
    let mut pending: Option<String> = None;

    loop {
        let prompt = if pending.is_some() {
            "clarify> "
        } else {
            "query> "
        };
        let readline = tokio::task::block_in_place(|| editor.readline(prompt));
        let line = match readline {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("Failed to read input: {e}")),
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        let _ = editor.add_history_entry(input);

        let outcome = match pending.take() {
            Some(key) => run_resume(&session, &key, input).await,
            None => run_query(&session, input).await,
        };
        pending = print_outcome(&outcome);
        println!();
    }

    let stats = session.engine.stats().await;
    println!(
        "\nSession summary: {} request(s), {} succeeded, {} failed ({:.0}% success)",
        stats.total_requests,
        stats.successful_requests,
        stats.failed_requests,
        stats.success_rate * 100.0
    );

    Ok(())
}
