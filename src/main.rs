use anyhow::{bail, Context, Result};
use chatbi_reasoner::agent::{
    ClarificationAnswer, ClarificationQuestion, HttpQueryExecutor, ReasoningOrchestrator, TurnRequest,
};
use chatbi_reasoner::config::AppConfig;
use chatbi_reasoner::llm::{OpenAiClient, OpenAiEmbedder};
use chatbi_reasoner::security::SecurityGate;
use chatbi_reasoner::semantic::vector_store::Embedder;
use chatbi_reasoner::semantic::{HashingEmbedder, SemanticCatalog};
use chatbi_reasoner::stream::StreamEvent;
use chatbi_reasoner::tenant::{MetadataTenantDirectory, RawRequest, TenantContext, TenantGuard};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatbi")]
#[command(about = "Answer business questions with validated, self-repairing SQL")]
struct Cli {
    /// Metadata root holding one directory per tenant (or set CHATBI_METADATA_DIR)
    #[arg(short, long, global = true)]
    metadata_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Identity {
    #[arg(short, long)]
    tenant: String,

    #[arg(short, long, default_value = "cli")]
    user: String,

    #[arg(short, long)]
    session: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a question and stream the answer
    Ask {
        question: String,

        #[command(flatten)]
        identity: Identity,

        /// Use local hashing embeddings instead of the embedding API
        #[arg(long)]
        offline_embeddings: bool,
    },
    /// Run a query through the security gate only
    CheckSql { sql: String },
    /// Show how the semantic layer resolves a question
    Resolve {
        question: String,

        #[command(flatten)]
        identity: Identity,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = cli.metadata_dir {
        config.metadata_root = dir;
    }

    match cli.command {
        Command::CheckSql { sql } => {
            let verdict = SecurityGate::new().validate(&sql);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if !verdict.is_safe {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Resolve { question, identity } => {
            let ctx = attach(&config, &identity).await?;
            let catalog = SemanticCatalog::new(Arc::new(HashingEmbedder::default()), config.pruning.clone())
                .with_metadata_root(&config.metadata_root);
            let snapshot = catalog.snapshot(&ctx).await?.into_inner(&ctx)?;
            let today = chrono::Local::now().date_naive();
            let resolved = snapshot.resolver.resolve(&snapshot.glossary, &question, today).await?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
            Ok(())
        }
        Command::Ask {
            question,
            identity,
            offline_embeddings,
        } => ask(config, identity, question, offline_embeddings).await,
    }
}

async fn attach(config: &AppConfig, identity: &Identity) -> Result<TenantContext> {
    let guard = TenantGuard::new(Arc::new(MetadataTenantDirectory::new(&config.metadata_root)));
    let ctx = guard
        .attach(&RawRequest {
            tenant_id: Some(identity.tenant.clone()),
            user_id: Some(identity.user.clone()),
            session_id: identity.session.clone(),
        })
        .await?;
    Ok(ctx)
}

async fn ask(config: AppConfig, identity: Identity, question: String, offline_embeddings: bool) -> Result<()> {
    let Some(api_key) = config.openai_api_key.clone() else {
        bail!("OPENAI_API_KEY is required for `ask`");
    };
    let ctx = attach(&config, &identity).await?;

    let llm = OpenAiClient::new(api_key.clone(), config.openai_base_url.clone(), config.llm_model.clone())?;
    let embedder: Arc<dyn Embedder> = if offline_embeddings {
        Arc::new(HashingEmbedder::default())
    } else {
        Arc::new(OpenAiEmbedder::new(
            api_key,
            config.openai_base_url.clone(),
            config.embedding_model.clone(),
        ))
    };
    let catalog = SemanticCatalog::new(embedder, config.pruning.clone()).with_metadata_root(&config.metadata_root);
    let executor = HttpQueryExecutor::new(config.executor_url.clone(), config.orchestrator.turn_timeout)?;
    let orchestrator = Arc::new(ReasoningOrchestrator::new(
        Arc::new(llm),
        Arc::new(executor),
        Arc::new(catalog),
        config.orchestrator.clone(),
    ));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(config.orchestrator.event_buffer);
    let turn = {
        let orchestrator = Arc::clone(&orchestrator);
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .run_turn(&ctx, TurnRequest::new(question), tx, cancel)
                .await
        })
    };

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Content { delta } => {
                print!("{}", delta);
                io::stdout().flush()?;
            }
            StreamEvent::Thinking { delta } => eprintln!("… {}", delta),
            StreamEvent::ProcessingStep { step } => eprintln!("▶ {}", step),
            StreamEvent::ToolResult { tool_name, result } if tool_name == "ask_clarification" => {
                let questions: Vec<ClarificationQuestion> =
                    serde_json::from_value(result["questions"].clone()).context("clarification payload")?;
                let answer = prompt_clarification(questions).await?;
                if let Err(e) = orchestrator.clarifications().answer(&ctx, answer) {
                    eprintln!("Clarification not delivered: {}", e);
                }
            }
            StreamEvent::ToolResult { tool_name, result } => {
                eprintln!("[{}] {} rows", tool_name, result["row_count"]);
            }
            StreamEvent::ChartConfig { .. } => eprintln!("(chart available)"),
            StreamEvent::Error { message } => eprintln!("\nError: {}", message),
            StreamEvent::Done { outcome } => {
                println!();
                info!("Turn done: {:?}", outcome);
            }
            StreamEvent::ConnectionInit { .. } | StreamEvent::ToolInput { .. } => {}
        }
    }

    let report = turn.await?;
    if let Some(sql) = &report.sql {
        eprintln!("\nSQL: {}", sql);
    }
    eprintln!(
        "Outcome: {} ({} executions, {} repairs)",
        report.outcome.as_str(),
        report.executions,
        report.repair_attempts
    );
    Ok(())
}

async fn prompt_clarification(questions: Vec<ClarificationQuestion>) -> Result<ClarificationAnswer> {
    tokio::task::spawn_blocking(move || -> Result<ClarificationAnswer> {
        let mut options = Vec::new();
        for question in &questions {
            println!("\n{}", question.prompt);
            for option in &question.options {
                options.push(option.id.clone());
                println!("  {}. {}", options.len(), option.label);
            }
        }
        print!("Your choice (number or free text): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();
        Ok(match input.parse::<usize>() {
            Ok(n) if n >= 1 && n <= options.len() => ClarificationAnswer {
                option_id: Some(options[n - 1].clone()),
                text: String::new(),
            },
            _ => ClarificationAnswer::text(input),
        })
    })
    .await?
}
