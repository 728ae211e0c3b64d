use clap::{Parser, Subcommand};
use semantic_store::Result;
use semantic_store::commands::{
    generate_embeddings, parse_entity_selector, reconcile_model, search_model, show_config,
};
use semantic_store::vector::GenerateOptions;

#[derive(Parser)]
#[command(name = "semantic-store")]
#[command(about = "Persistence and vector indexing for database semantic models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate embeddings for a model's entities
    Generate {
        /// Model name
        model: String,
        /// Upsert generated vectors into the configured index
        #[arg(long)]
        push: bool,
        /// Re-embed entities whose content is unchanged
        #[arg(long)]
        overwrite: bool,
        /// Stop at the first failed entity
        #[arg(long)]
        fail_fast: bool,
        /// Only embed these entities, e.g. "table:dbo.Customer"
        #[arg(long = "entity")]
        entities: Vec<String>,
    },
    /// Search a model's entities by meaning
    Search {
        model: String,
        query: String,
        /// Number of hits to return
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
    /// Compare stored embeddings with the vector index and repair drift
    Reconcile {
        model: String,
        /// Report drift without changing the index
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            push,
            overwrite,
            fail_fast,
            entities,
        } => {
            let entities = if entities.is_empty() {
                None
            } else {
                Some(
                    entities
                        .iter()
                        .map(|selector| parse_entity_selector(selector))
                        .collect::<anyhow::Result<Vec<_>>>()?,
                )
            };
            generate_embeddings(
                &model,
                GenerateOptions {
                    push,
                    overwrite,
                    fail_fast,
                    entities,
                },
            )
            .await?;
        }
        Commands::Search {
            model,
            query,
            limit,
        } => {
            search_model(&model, &query, limit).await?;
        }
        Commands::Reconcile { model, dry_run } => {
            reconcile_model(&model, dry_run).await?;
        }
        Commands::ShowConfig => {
            show_config()?;
        }
    }

    Ok(())
}
