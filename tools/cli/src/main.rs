//! Polyweave CLI
//!
//! Command-line interface for validating orchestrator configurations and
//! running JSON workloads through the executor.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use polyweave_common::CrudOperation;
use polyweave_engine::{Executor, OrchestratorConfig};
use polyweave_storage::create_default_factories;

#[derive(Parser)]
#[command(name = "polyweave")]
#[command(about = "Multi-backend CRUD orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print its providers and settings
    Check {
        /// Path to the JSON configuration
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Execute a JSON workload against the configured providers
    Run {
        /// Path to the JSON configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the workload: an array of operations, or an object with an
        /// "operations" array
        #[arg(short, long)]
        workload: PathBuf,
    },
}

/// Workload file contents.
#[derive(Deserialize)]
#[serde(untagged)]
enum Workload {
    List(Vec<CrudOperation>),
    Document { operations: Vec<CrudOperation> },
}

impl Workload {
    fn into_operations(self) -> Vec<CrudOperation> {
        match self {
            Workload::List(operations) => operations,
            Workload::Document { operations } => operations,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Check { config } => cmd_check(&config),

        Commands::Run { config, workload } => cmd_run(&config, &workload).await,
    }
}

fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    OrchestratorConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn load_workload(path: &Path) -> Result<Vec<CrudOperation>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workload {}", path.display()))?;
    let workload: Workload = serde_json::from_str(&json).context("Invalid workload")?;
    Ok(workload.into_operations())
}

/// Validate configuration.
fn cmd_check(path: &Path) -> Result<()> {
    info!("Checking configuration: {}", path.display());

    let config = load_config(path)?;

    println!("Configuration is valid.");
    println!("Providers ({}):", config.providers.len());
    for provider in &config.providers {
        println!(
            "  {} [{}] driver={} priority={}{}",
            provider.name,
            provider.kind,
            provider.connection.driver(),
            provider.priority,
            if provider.enabled { "" } else { " (disabled)" }
        );
        if !provider.capabilities.is_empty() {
            let capabilities: Vec<&str> =
                provider.capabilities.iter().map(String::as_str).collect();
            println!("    Capabilities: {}", capabilities.join(", "));
        }
        if !provider.regions.is_empty() {
            let regions: Vec<&str> = provider.regions.iter().map(String::as_str).collect();
            println!("    Regions: {}", regions.join(", "));
        }
    }

    if let Some(default) = &config.default_provider {
        println!("Default provider: {}", default);
    }
    if let Some(region) = &config.local_region {
        println!("Local region: {}", region);
    }
    if let Some(sharding) = &config.sharding {
        println!(
            "Sharding: {} shards on '{}'",
            sharding.shard_count, sharding.shard_key
        );
    }

    let replication = &config.replication;
    println!("Replication:");
    println!("  Factor: {}", replication.factor);
    println!("  Consistency: {:?}", replication.consistency);
    println!("  Read preference: {:?}", replication.read_preference);

    let caching = &config.caching;
    println!("Caching:");
    println!("  Enabled: {}", caching.enabled);
    println!("  Eviction: {:?}", caching.eviction);
    println!("  Max entries: {}", caching.max_entries);
    println!("  TTL: {} ms", caching.ttl_ms);

    println!("Conflicts:");
    println!("  Strategy: {}", config.conflict.strategy);
    println!("  Vector clocks: {}", config.conflict.vector_clocks);

    println!("Executor:");
    println!("  Timeout: {} ms", config.executor.default_timeout_ms);
    println!("  Max retries: {}", config.executor.max_retries);

    Ok(())
}

/// Run a workload and print every result envelope.
async fn cmd_run(config_path: &Path, workload_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let operations = load_workload(workload_path)?;

    info!(
        "Running {} operations against {} providers",
        operations.len(),
        config.providers.len()
    );

    let executor = Executor::from_config(&config, &create_default_factories())
        .await
        .context("Failed to build executor")?;
    let tasks = executor.start_background_tasks();

    let mut failed = 0usize;
    for operation in operations {
        let result = executor.execute(operation).await;
        if !result.success {
            failed += 1;
        }
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    executor.process_conflict_queue().await;
    let metrics = executor.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    executor.shutdown(Some(tasks)).await;

    if failed > 0 {
        info!("{} operations failed", failed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyweave_common::OperationKind;
    use tempfile::TempDir;

    #[test]
    fn test_load_workload_list() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workload.json");
        std::fs::write(
            &path,
            r#"[
                {"type": "create", "collection": "users", "data": {"id": "u1"}},
                {"type": "read", "collection": "users", "filter": {"id": "u1"}}
            ]"#,
        )
        .unwrap();

        let operations = load_workload(&path).unwrap();
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0].kind, OperationKind::Create);
        assert_eq!(operations[1].kind, OperationKind::Read);
    }

    #[test]
    fn test_load_workload_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workload.json");
        std::fs::write(
            &path,
            r#"{"operations": [{"type": "delete", "collection": "users", "filter": {"id": "u1"}}]}"#,
        )
        .unwrap();

        let operations = load_workload(&path).unwrap();
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].kind, OperationKind::Delete);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"replication": {"factor": 0}}"#).unwrap();

        assert!(load_config(&path).is_err());
        assert!(load_config(&dir.path().join("missing.json")).is_err());
    }
}
