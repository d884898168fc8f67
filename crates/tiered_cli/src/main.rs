//! TIERED CLI
//!
//! Loads a manifest of functions into an in-memory registry and drives the
//! dispatch engine against it.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod manifest;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use manifest::{EngineConfig, Manifest, json_argument};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tiered_core::{CoreResult, FunctionMetadata, JsonSchema, TierKind, Version};
use tiered_dispatch::{Dispatcher, Executors, TierExecutor, TierResponse, validate_input};
use tiered_loader::{CodeRuntime, ResilientLoader, TemplateRuntime};
use tiered_registry::{FunctionStore, MemoryStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tiered")]
#[command(about = "TIERED - tiered function dispatch engine", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch one invocation
    Dispatch {
        /// Function manifest
        #[arg(short, long)]
        manifest: PathBuf,
        /// Function id
        #[arg(short, long)]
        function: String,
        /// Version to dispatch (defaults to current)
        #[arg(long)]
        version: Option<String>,
        /// Input JSON, or @path to read it from a file
        #[arg(short, long, default_value = "{}")]
        input: String,
        /// Engine config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Source file to run instead of the deployed code
        #[arg(long)]
        source: Option<PathBuf>,
        /// Answer generative, agentic and human tiers with an echo executor
        #[arg(long)]
        echo: bool,
    },
    /// Validate input against a schema
    Validate {
        /// Schema JSON, or @path
        #[arg(short, long)]
        schema: String,
        /// Input JSON, or @path
        #[arg(short, long)]
        input: String,
    },
    /// Load every code function and report loader state
    Inspect {
        /// Function manifest
        #[arg(short, long)]
        manifest: PathBuf,
        /// Engine config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Executor that answers with what it was asked
struct EchoExecutor;

#[async_trait]
impl TierExecutor for EchoExecutor {
    async fn execute(&self, metadata: &FunctionMetadata, input: &Value) -> CoreResult<TierResponse> {
        Ok(TierResponse::new(json!({
            "function": metadata.id,
            "tier": metadata.kind(),
            "input": input,
        })))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tiered=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn engine(store: Arc<MemoryStore>, config: EngineConfig, echo: bool) -> Dispatcher {
    let runtime: Arc<dyn CodeRuntime> = Arc::new(TemplateRuntime::new());
    let registry: Arc<dyn FunctionStore> = store;
    let loader = ResilientLoader::new(Arc::clone(&registry), Arc::clone(&runtime), config.loader);

    let executors = if echo {
        let echo: Arc<dyn TierExecutor> = Arc::new(EchoExecutor);
        Executors::new()
            .with_generative(Arc::clone(&echo))
            .with_agentic(Arc::clone(&echo))
            .with_human(echo)
    } else {
        Executors::new()
    };

    Dispatcher::new(registry)
        .with_loader(loader)
        .with_runtime(runtime)
        .with_executors(executors)
        .with_config(config.dispatch)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Dispatch {
            manifest,
            function,
            version,
            input,
            config,
            source,
            echo,
        } => {
            let store = Arc::new(Manifest::load(&manifest)?.into_store()?);
            let config = EngineConfig::load(config.as_deref())?;
            let version = version
                .map(|v| Version::parse(&v))
                .transpose()
                .wrap_err("invalid --version")?;
            let input = json_argument(&input).wrap_err("invalid --input")?;
            let source = source
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .wrap_err_with(|| format!("reading source {}", path.display()))
                })
                .transpose()?;

            let metadata = store
                .get_metadata(&function, version.as_ref())
                .await
                .wrap_err_with(|| format!("resolving {function}"))?;
            let dispatcher = engine(store, config, echo);
            let result = dispatcher.dispatch(&metadata, input, source.as_deref()).await;

            print_json(&result)?;
            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Validate { schema, input } => {
            let schema: JsonSchema = serde_json::from_value(json_argument(&schema)?)
                .wrap_err("schema is not a valid input schema")?;
            let errors = validate_input(&json_argument(&input)?, &schema);

            print_json(&json!({ "valid": errors.is_empty(), "errors": errors }))?;
            Ok(if errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Inspect { manifest, config } => {
            let manifest = Manifest::load(&manifest)?;
            let code_ids: Vec<String> = manifest
                .functions
                .iter()
                .filter(|entry| entry.metadata.kind() == TierKind::Code)
                .map(|entry| entry.metadata.id.clone())
                .fold(Vec::new(), |mut ids, id| {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                    ids
                });
            let store = Arc::new(manifest.into_store()?);
            let dispatcher = engine(store, EngineConfig::load(config.as_deref())?, false);
            let loader = dispatcher
                .loader()
                .ok_or_else(|| eyre!("dispatcher has no loader"))?;

            let mut loads = Vec::with_capacity(code_ids.len());
            for id in &code_ids {
                let report = loader.load_with_result(id, None).await;
                loads.push(json!({
                    "id": id,
                    "version": report.handle.as_ref().map(|h| h.version().to_string()),
                    "loadedAt": report.handle.as_ref().map(|h| h.loaded_at()),
                    "success": report.success,
                    "loadTimeMs": report.load_time_ms,
                    "retryCount": report.retry_count,
                    "degraded": report.degraded,
                    "error": report.error.map(|e| e.to_string()),
                }));
            }

            let metrics = loader.metrics();
            print_json(&json!({
                "loads": loads,
                "successRate": metrics.success_rate(),
                "metrics": metrics,
                "cache": loader.cache_stats(),
                "health": loader.health_check(),
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
