use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use scout_nql::canonical::{
    CanonicalStore, CanonicalWatcher, FilterResolver, MappingRepository, SqliteVocabulary,
    StaticVocabulary, StoreOptions, VocabularySource,
};
use scout_nql::config::NqlConfig;
use scout_nql::nql::{CompileOptions, PlanCompiler, PlanValidator, QueryPlan};
use scout_nql::semantic::{load_from_path, SemanticModel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nql")]
#[command(about = "Validate and compile NQL query plans, and administer canonical values")]
struct Args {
    /// Semantic model JSON (overrides NQL_SEMANTIC_MODEL)
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Canonical mapping database (overrides NQL_CANONICAL_DB)
    #[arg(long, global = true)]
    canonical_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a plan to SQL; prints SQL, bind parameters and lineage as JSON
    Compile {
        /// Plan file, or `-` for stdin
        plan: PathBuf,

        /// Anchor date for relative windows (default: today, UTC)
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Resolve one filter value through the canonical store
    Lookup { dimension: String, value: String },
    /// Rank canonical candidates for a token
    Search { dimension: String, token: String },
    /// Promote a synonym to a canonical value
    Promote {
        dimension: String,
        synonym: String,
        canonical: String,
        #[arg(long)]
        score: Option<f64>,
        #[arg(long)]
        by: Option<String>,
    },
    /// Run the canonical watcher until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = NqlConfig::from_env()?;
    if let Some(model) = args.model {
        config.semantic_model_path = model;
    }
    if let Some(db) = args.canonical_db {
        config.canonical_db_path = db;
    }

    let model = load_from_path(&config.semantic_model_path)
        .with_context(|| format!("loading {}", config.semantic_model_path.display()))?;
    let store = open_store(&config, Arc::clone(&model))?;

    match args.command {
        Command::Compile { plan, today } => {
            let raw = if plan.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&plan).with_context(|| format!("reading {}", plan.display()))?
            };
            let plan = QueryPlan::from_json(&raw)?;
            let validated = PlanValidator::new(model.as_ref())
                .with_v2_enabled(config.v2_enabled)
                .validate(plan)?;
            let filters = FilterResolver::new(store, Arc::clone(&model))
                .resolve_with_timeout(&validated)
                .await?;
            let options = today.map(CompileOptions::anchored).unwrap_or_default();
            let compiled = PlanCompiler::new(model).compile(&validated, &filters, &options)?;
            let output = serde_json::json!({
                "sql": compiled.sql,
                "params": compiled.params,
                "lineage": compiled.lineage.to_value()?,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Lookup { dimension, value } => {
            let resolved = store.lookup_with_timeout(&dimension, &value).await?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        Command::Search { dimension, token } => {
            let candidates = store.search_with_timeout(&dimension, &token).await?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }
        Command::Promote { dimension, synonym, canonical, score, by } => {
            let outcome = store.promote(&dimension, &synonym, &canonical, score, by.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Watch => {
            let watcher = CanonicalWatcher::spawn(store.clone(), config.poll_interval);
            info!(version = store.version()?, "Watching canonical store, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            watcher.shutdown().await;
        }
    }

    Ok(())
}

fn open_store(config: &NqlConfig, model: Arc<SemanticModel>) -> Result<CanonicalStore> {
    let repo = MappingRepository::open(&config.canonical_db_path, config.store_timeout)?;
    let vocabulary: Arc<dyn VocabularySource> = match &config.warehouse_db_path {
        Some(path) => Arc::new(SqliteVocabulary::open(path, model, config.store_timeout)?),
        None => Arc::new(StaticVocabulary::new()),
    };
    Ok(CanonicalStore::open(repo, vocabulary, StoreOptions::from_config(config))?)
}
