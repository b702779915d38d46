//! triage CLI - dispatch file-analysis tasks to analyzers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;
use triage_analyzers::{AnalyzerRegistry, CommandAnalyzer};
use triage_core::{AnalyzerOptions, ArtifactRef, TaskEnvelope, TaskId};
use triage_execution::{Engine, EngineConfig, JsonLinesSink, JsonLinesSource};
use triage_storage::{FsArtifactStore, JsonResultStore, ResultStore};

#[derive(Parser)]
#[command(name = "triage")]
#[command(about = "File-analysis task dispatcher", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "TRIAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for output artifacts
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,

    /// Directory for stored results
    #[arg(long, global = true)]
    results: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered analyzers
    Analyzers {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one analyzer over files and print the report
    Scan {
        /// Analyzer name
        analyzer: String,
        /// Input files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Analyzer option as key=value (value parsed as JSON when possible)
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
        /// Run deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Priority (0-255)
        #[arg(long, default_value = "0")]
        priority: u8,
    },
    /// Execute JSON-lines envelopes, writing JSON-lines reports to stdout
    Run {
        /// Envelope file, or - for stdin
        #[arg(long, default_value = "-")]
        input: String,
    },
    /// Show a stored result
    Show {
        /// Task ID
        id: String,
    },
    /// List stored results
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = cli.artifacts {
        config.artifact_root = dir;
    }
    if let Some(dir) = cli.results {
        config.result_dir = dir;
    }

    match cli.command {
        Commands::Analyzers { json } => {
            let registry = build_registry(&config)?;
            let descriptors = registry.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&descriptors)?);
                return Ok(());
            }

            println!("Analyzers ({})", descriptors.len());
            for d in descriptors {
                println!("  {} [{}] - {}", d.name, d.class, d.description);
                for option in &d.options {
                    let required = if option.required { " (required)" } else { "" };
                    let default = option
                        .default
                        .as_ref()
                        .map(|v| format!(", default {}", v))
                        .unwrap_or_default();
                    println!(
                        "      {}: {}{}{} - {}",
                        option.name, option.kind, required, default, option.description
                    );
                }
            }
        }
        Commands::Scan { analyzer, files, options, timeout, priority } => {
            let mut builder = TaskEnvelope::builder(analyzer)
                .options(parse_options(&options)?)
                .priority(priority);
            for file in &files {
                let artifact = ArtifactRef::from_path(file)
                    .with_context(|| format!("cannot read {}", file.display()))?;
                builder = builder.input(artifact);
            }
            if let Some(secs) = timeout {
                builder = builder.deadline(Duration::from_secs(secs));
            }

            let engine = build_engine(config).await?;
            let report = engine.process(builder.build()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run { input } => {
            let engine = build_engine(config).await?;
            let mut sink = JsonLinesSink::new(tokio::io::stdout());

            let stats = if input == "-" {
                let source = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
                engine.run(source, &mut sink).await?
            } else {
                let file = tokio::fs::File::open(&input)
                    .await
                    .with_context(|| format!("cannot open {}", input))?;
                engine.run(JsonLinesSource::new(BufReader::new(file)), &mut sink).await?
            };
            info!(
                received = stats.received,
                completed = stats.completed,
                rejected = stats.rejected,
                malformed = stats.malformed,
                "done"
            );
        }
        Commands::Show { id } => {
            let task_id: TaskId = id.parse().map_err(|_| anyhow::anyhow!("Invalid task ID"))?;
            let store = JsonResultStore::new(&config.result_dir).await?;
            let Some(result) = store.get(task_id).await? else {
                println!("Result not found");
                return Ok(());
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::List => {
            let store = JsonResultStore::new(&config.result_dir).await?;
            let results = store.list().await?;

            println!("Results ({})", results.len());
            for result in results {
                println!(
                    "  {} | {} | {} | {} finding(s) - {}",
                    result.task_id,
                    result.analyzer,
                    result.status,
                    result.findings.len(),
                    result.diagnostic,
                );
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // stdout carries reports; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_registry(config: &EngineConfig) -> Result<AnalyzerRegistry> {
    let mut registry = AnalyzerRegistry::with_builtins();
    for spec in &config.commands {
        registry
            .register(Arc::new(CommandAnalyzer::new(spec.clone())))
            .with_context(|| format!("cannot register command analyzer {}", spec.name))?;
    }
    Ok(registry)
}

async fn build_engine(config: EngineConfig) -> Result<Engine> {
    let registry = build_registry(&config)?;

    let mut artifacts = FsArtifactStore::new(&config.artifact_root).await?;
    if !config.verify_inputs {
        artifacts = artifacts.without_hash_verification();
    }
    let results = JsonResultStore::new(&config.result_dir).await?;

    Ok(Engine::new(registry, Arc::new(artifacts), Arc::new(results), config))
}

/// Parse `key=value` pairs. Values that are valid JSON (numbers, booleans,
/// quoted strings) keep their type; anything else is taken as a string.
fn parse_options(pairs: &[String]) -> Result<AnalyzerOptions> {
    let mut options = AnalyzerOptions::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("option '{}' is not key=value", pair))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        options.insert(key.trim().to_string(), value);
    }
    Ok(options)
}
