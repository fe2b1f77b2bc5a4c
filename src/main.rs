mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ideaforge_core::config::AppConfig;
use ideaforge_core::event::EventBus;
use ideaforge_core::types::{RunId, WorkspaceId};
use ideaforge_engine::{BudgetLedger, GraphDefinition, MemoryRunStore, RunSupervisor, StageExecutor};

#[derive(Parser)]
#[command(name = "ideaforge", version, about = "Multi-stage idea analysis pipeline")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ideaforge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one pipeline run with the built-in demo stages
    Run {
        /// Query to analyze
        #[arg(short, long, default_value = "developer tooling")]
        query: String,
    },
    /// Show effective configuration
    Config,
    /// Print the pipeline graph edge table
    Graph,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    match cli.command {
        Commands::Run { query } => run_pipeline(config, &query).await?,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph => {
            let graph = GraphDefinition::standard();
            graph.validate()?;
            for edge in graph.edges() {
                println!("{:<12} --[{}]--> {}", edge.from.to_string(), edge.outcome, edge.to);
            }
        }
    }

    Ok(())
}

async fn run_pipeline(config: AppConfig, query: &str) -> anyhow::Result<()> {
    let graph = Arc::new(GraphDefinition::standard());
    let events = Arc::new(EventBus::new(config.engine.event_capacity));
    let cancel = CancellationToken::new();

    let mut executor = StageExecutor::new(Duration::from_secs(config.budget.stage_timeout_secs));
    demo::register_demo_stages(&mut executor, query);

    let supervisor = RunSupervisor::new(
        &config,
        graph.clone(),
        executor,
        Arc::new(BudgetLedger::new(config.budget.clone())),
        Arc::new(MemoryRunStore::with_graph(&graph)),
        events.clone(),
        cancel.clone(),
    )?;

    // Ctrl-C cancels cooperatively at the next suspension point.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    // Stream progress events to the terminal.
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            println!(
                "[{}] {:<16} {:?} {}",
                event.timestamp.format("%H:%M:%S%.3f"),
                event.node.to_string(),
                event.phase,
                event.payload
            );
        }
    });

    let workspace = WorkspaceId::new(config.engine.workspace.clone());
    let report = supervisor.execute(RunId::new(), workspace).await?;
    printer.abort();

    info!(
        run_id = %report.run.id,
        status = %report.run.status,
        units = report.units_spent,
        "run finished"
    );
    println!();
    println!("run {}: {}", report.run.id, report.run.status);
    if let Some(reason) = &report.run.terminal_reason {
        println!("reason: {reason}");
    }
    println!("nodes visited: {}", report.trail.len());
    println!("units spent: {}", report.units_spent);
    for (node, (units, elapsed_ms)) in &report.node_spend {
        println!("  {:<12} {} units, {} ms", node.to_string(), units, elapsed_ms);
    }

    Ok(())
}
