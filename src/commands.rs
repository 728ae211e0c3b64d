use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, get_config_dir};
use crate::model::{EntityId, EntityKind};
use crate::repository::RepositoryOptions;
use crate::storage::ModelLocation;
use crate::vector::{GenerateOptions, GenerateSummary, VectorOrchestrator};

/// Loads the configuration from the default directory
#[inline]
pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir()?;
    Config::load(&config_dir)
}

async fn orchestrator(config: &Config) -> Result<VectorOrchestrator> {
    VectorOrchestrator::from_config(config, &RepositoryOptions::new().with_caching(true))
        .await
        .context("Failed to initialize vector orchestration")
}

/// Parses `kind:schema.name` entity selectors
#[inline]
pub fn parse_entity_selector(selector: &str) -> Result<EntityId> {
    let (kind, qualified) = selector
        .split_once(':')
        .with_context(|| format!("Entity selector {:?} must look like kind:schema.name", selector))?;
    let kind = EntityKind::parse(kind)
        .with_context(|| format!("Unknown entity kind {:?}", kind))?;
    let (schema, name) = qualified
        .split_once('.')
        .with_context(|| format!("Entity selector {:?} is missing a schema", selector))?;
    Ok(EntityId::new(kind, schema, name))
}

/// Stops the run on Ctrl-C while keeping completed work
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work");
            child.cancel();
        }
    });
    token
}

#[inline]
pub async fn generate_embeddings(
    model: &str,
    options: GenerateOptions,
) -> Result<GenerateSummary> {
    let config = load_config()?;
    let orchestrator = orchestrator(&config).await?;
    let location = ModelLocation::new(model)?;

    let summary = orchestrator
        .generate(&location, &options, &cancel_on_ctrl_c())
        .await?;

    println!(
        "{}: {} generated, {} skipped, {} pushed, {} failed",
        model, summary.generated, summary.skipped, summary.pushed, summary.failed
    );
    for failure in &summary.failures {
        println!("  {}: {}", failure.target, failure.message);
    }
    if summary.cancelled {
        println!("Run was cancelled; completed embeddings were kept");
    }
    Ok(summary)
}

#[inline]
pub async fn search_model(model: &str, query: &str, limit: usize) -> Result<()> {
    let config = load_config()?;
    let orchestrator = orchestrator(&config).await?;

    let hits = orchestrator.search(model, query, limit).await?;
    if hits.is_empty() {
        println!("No matches in {}", model);
        return Ok(());
    }

    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>2}. {:<16} {}.{}  ({:.4})",
            rank + 1,
            hit.kind.as_str(),
            hit.schema,
            hit.name,
            hit.score
        );
    }
    Ok(())
}

#[inline]
pub async fn reconcile_model(model: &str, dry_run: bool) -> Result<()> {
    let config = load_config()?;
    let orchestrator = orchestrator(&config).await?;
    let location = ModelLocation::new(model)?;

    let report = orchestrator
        .reconcile(&location, dry_run, &cancel_on_ctrl_c())
        .await?;
    println!("{}", report.summary());
    for drift in report.missing.iter() {
        println!("  missing   {}", drift.id);
    }
    for drift in report.outdated.iter() {
        println!("  outdated  {}", drift.id);
    }
    for drift in report.orphaned.iter() {
        println!("  orphaned  {}", drift.id);
    }
    Ok(())
}

#[inline]
pub fn show_config() -> Result<()> {
    let config = load_config()?;
    info!("Showing configuration from {}", config.config_file_path().display());

    println!("Configuration file: {}", config.config_file_path().display());
    println!("Storage strategy:   {}", config.storage.strategy);
    println!("Vector provider:    {}", config.vector_index.provider);
    println!(
        "Embedding service:  {} ({} dimensions)",
        config.vector_index.embedding_service, config.vector_index.expected_dimension
    );
    if config.vector_index.embedding_service == "ollama" {
        println!(
            "Ollama endpoint:    {} (model {})",
            config.ollama.ollama_url()?,
            config.ollama.model
        );
    }
    println!();
    println!(
        "{}",
        toml::to_string_pretty(&config).context("Failed to render configuration")?
    );
    Ok(())
}
