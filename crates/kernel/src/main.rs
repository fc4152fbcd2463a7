//! Datagate command line.
//!
//! Compiles filter documents for the relational, catalog or search backend
//! and optionally runs them against the configured database or catalog.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use datagate_kernel::catalog::{CatalogService, RestCatalogSession, compile_catalog};
use datagate_kernel::config::Config;
use datagate_kernel::filter::{FilterSet, parse_filter_document};
use datagate_kernel::relational::{Dialect, RelationalService, RowFetcher, compile_sql};
use datagate_kernel::schema::{catalog, ddl};
use datagate_kernel::search::{MappingTable, SearchService, compile_search};

#[derive(Parser)]
#[command(name = "datagate", version, about = "Facility catalog filter compiler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the query a filter document compiles to.
    Compile(QueryArgs),
    /// Run a filter document and print the matching records.
    Query(QueryArgs),
    /// Print the number of records matching a filter document.
    Count(QueryArgs),
    /// Load and validate a search mapping.
    CheckMapping {
        /// Mapping file; defaults to SEARCH_MAPPING_PATH or the bundled mapping.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print CREATE TABLE statements for the catalog schema.
    Ddl {
        #[arg(long)]
        dialect: Option<Dialect>,
    },
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long, value_enum, default_value_t = Backend::Sql)]
    backend: Backend,

    /// Entity to query, in the backend's vocabulary.
    #[arg(long)]
    entity: String,

    /// One filter object or a list of them.
    #[arg(default_value = "[]")]
    filters: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Sql,
    Catalog,
    Search,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    info!(dialect = %config.sql_dialect, "configuration loaded");

    match cli.command {
        Command::Compile(args) => compile(&config, &args),
        Command::Query(args) => query(&config, &args).await,
        Command::Count(args) => count(&config, &args).await,
        Command::CheckMapping { path } => {
            let path = path.or_else(|| config.search_mapping_path.clone());
            let mapping = load_mapping(path.as_ref())?;
            for (name, entity) in mapping.entities() {
                println!("{name} -> {} ({} fields)", entity.native_entity, entity.fields.len());
            }
            Ok(())
        }
        Command::Ddl { dialect } => {
            for statement in ddl::create_all(catalog(), dialect.unwrap_or(config.sql_dialect)) {
                println!("{statement};");
            }
            Ok(())
        }
    }
}

fn parse_args(args: &QueryArgs) -> Result<FilterSet> {
    let filters = parse_filter_document(&args.filters).context("invalid filter document")?;
    Ok(FilterSet::from(filters))
}

fn compile(config: &Config, args: &QueryArgs) -> Result<()> {
    let filters = parse_args(args)?;
    let rendered = match args.backend {
        Backend::Sql => compile_sql(&args.entity, &filters, config.sql_dialect)?.sql,
        Backend::Catalog => {
            compile_catalog(&args.entity, &filters, config.catalog_max_entities)?.to_string()
        }
        Backend::Search => {
            let mapping = load_mapping(config.search_mapping_path.as_ref())?;
            compile_search(&args.entity, &filters, &mapping, config.catalog_max_entities)?
                .to_string()
        }
    };
    println!("{rendered}");
    Ok(())
}

async fn query(config: &Config, args: &QueryArgs) -> Result<()> {
    let filters = parse_args(args)?;
    let results = match args.backend {
        Backend::Sql => {
            relational_service(config)
                .await?
                .get_with_filters(&args.entity, &filters)
                .await?
        }
        Backend::Catalog => {
            catalog_service(config)?
                .get_with_filters(&args.entity, &filters)
                .await?
        }
        Backend::Search => {
            search_service(config)?
                .search(&args.entity, &filters)
                .await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&Value::Array(results))?);
    Ok(())
}

async fn count(config: &Config, args: &QueryArgs) -> Result<()> {
    let filters = parse_args(args)?;
    let count = match args.backend {
        Backend::Sql => {
            relational_service(config)
                .await?
                .count_with_filters(&args.entity, &filters)
                .await?
        }
        Backend::Catalog => {
            catalog_service(config)?
                .count_with_filters(&args.entity, &filters)
                .await?
        }
        Backend::Search => search_service(config)?.count(&args.entity, &filters).await?,
    };
    println!("{count}");
    Ok(())
}

async fn relational_service(config: &Config) -> Result<RelationalService> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for relational queries")?;

    let fetcher: Arc<dyn RowFetcher> = match config.sql_dialect {
        Dialect::Postgres => Arc::new(
            PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to PostgreSQL")?,
        ),
        Dialect::Sqlite => Arc::new(
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to open SQLite database")?,
        ),
    };
    info!(dialect = %config.sql_dialect, "database connection established");

    Ok(RelationalService::new(fetcher, config.include_child_limit))
}

fn catalog_session(config: &Config) -> Result<Arc<RestCatalogSession>> {
    let url = config
        .catalog_url
        .as_deref()
        .context("CATALOG_URL is required for catalog queries")?;
    let session_id = config
        .catalog_session_id
        .as_deref()
        .context("CATALOG_SESSION_ID is required for catalog queries")?;
    Ok(Arc::new(RestCatalogSession::new(url, session_id)))
}

fn catalog_service(config: &Config) -> Result<CatalogService> {
    Ok(CatalogService::new(
        catalog_session(config)?,
        config.catalog_max_entities,
    ))
}

fn search_service(config: &Config) -> Result<SearchService> {
    let mapping = load_mapping(config.search_mapping_path.as_ref())?;
    Ok(SearchService::new(
        catalog_session(config)?,
        Arc::new(mapping),
        config.catalog_max_entities,
    ))
}

fn load_mapping(path: Option<&PathBuf>) -> Result<MappingTable> {
    let mapping = match path {
        Some(path) => MappingTable::from_path(path)
            .with_context(|| format!("failed to load search mapping {}", path.display()))?,
        None => MappingTable::bundled().context("bundled search mapping is invalid")?,
    };
    info!(entities = mapping.entities().count(), "search mapping loaded");
    Ok(mapping)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
