use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use estate_adapters::FixtureExtractor;
use estate_sync::{
    criteria_from_workspace, pipeline_from_config, MemoryTarget, Pipeline, PipelineConfig,
    PipelineReport,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Incremental consolidation of scraped real-estate listings")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Workspace holding search_criteria.yaml and fixtures/.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Keep the versioned store on the local filesystem instead of S3.
    #[arg(long, global = true)]
    local_store: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, dedupe, merge into the versioned store, then export.
    Sync {
        /// Export into an in-memory table instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Rebuild the relational table from the current store.
    Export {
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the versioned store's commit history.
    Status,
}

fn build_pipeline(config: PipelineConfig, dry_run: bool) -> Result<Pipeline> {
    if !dry_run {
        return pipeline_from_config(config);
    }
    info!("dry run: exporting into an in-memory table");
    let extractor = Arc::new(FixtureExtractor::new(config.fixtures_dir.clone(), config.limit_each_page));
    let store = config.versioned_store();
    Ok(Pipeline::new(config, extractor, store, Arc::new(MemoryTarget::new())))
}

fn print_report(report: &PipelineReport) -> Result<ExitCode> {
    println!(
        "{}",
        serde_json::to_string_pretty(report).context("serializing pipeline report")?
    );
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = PipelineConfig::from_env();
    if let Some(workspace) = cli.workspace {
        config.fixtures_dir = workspace.join("fixtures");
        config.workspace_root = workspace;
    }
    if let Some(root) = cli.local_store {
        config.local_store_root = Some(root);
    }

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let criteria = criteria_from_workspace(&config)?;
            let pipeline = build_pipeline(config, dry_run)?;
            let report = pipeline.run(&criteria).await;
            print_report(&report)
        }
        Commands::Export { dry_run } => {
            let criteria = if config.filter_by_criteria {
                criteria_from_workspace(&config)?
            } else {
                Vec::new()
            };
            let pipeline = build_pipeline(config, dry_run)?;
            let report = pipeline.run_export_only(&criteria).await;
            print_report(&report)
        }
        Commands::Status => {
            let store = config.versioned_store();
            let history = store
                .history()
                .await
                .with_context(|| format!("reading commit log at {}", store.location()))?;
            let commits: Vec<_> = history
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "version": c.version,
                        "operation": c.operation,
                        "committed_at": c.committed_at,
                        "row_count": c.row_count,
                        "column_count": c.columns.len(),
                        "identity_field": c.identity_field,
                    })
                })
                .collect();
            let status = serde_json::json!({
                "store": store.location(),
                "exists": !commits.is_empty(),
                "commits": commits,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("serializing store status")?
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
