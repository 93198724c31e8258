use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use bookscout_core::{recommend, Item, RecommendRequest, Strategy};
use bookscout_store_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "bks")]
#[command(about = "Bookscout: content-similarity recommendations over a cached catalog")]
struct Cli {
    #[arg(long, default_value = "./bookscout.sqlite3")]
    db: PathBuf,

    /// Force debug-level logging (otherwise BOOKSCOUT_LOG, default warn).
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Recommend(RecommendArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Import(CatalogImportArgs),
    List,
}

#[derive(Debug, Args)]
struct CatalogImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct RecommendArgs {
    #[arg(long, value_enum, default_value_t = StrategyArg::Content)]
    strategy: StrategyArg,
    #[arg(long)]
    query: Option<String>,
    #[arg(long, default_value_t = 1)]
    top: usize,
    /// Do not append this recommendation to the history.
    #[arg(long, default_value_t = false)]
    no_record: bool,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List,
    Clear,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Content,
    Query,
    Fuzzy,
}

impl StrategyArg {
    fn into_strategy(self) -> Strategy {
        match self {
            Self::Content => Strategy::Content,
            Self::Query => Strategy::Query,
            Self::Fuzzy => Strategy::Fuzzy,
        }
    }
}

/// One record of the catalog hand-off file. Text fields default to empty so
/// malformed entries degrade instead of failing the whole import; only a
/// missing ID makes a record unusable.
#[derive(Debug, Clone, Deserialize)]
struct RawCatalogRecord {
    id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    topic: String,
}

#[derive(Debug, Clone, Serialize)]
struct SkippedRecord {
    index: usize,
    reason: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("BOOKSCOUT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    tracing::debug!(db = %cli.db.display(), "opening store");

    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Catalog { command } => run_catalog(command, &mut store),
        Command::Recommend(args) => run_recommend(&args, &mut store),
        Command::History { command } => run_history(command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn run_catalog(command: CatalogCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        CatalogCommand::Import(args) => {
            let body = fs::read_to_string(&args.input).with_context(|| {
                format!("failed to read catalog file {}", args.input.display())
            })?;
            let records: Vec<RawCatalogRecord> = serde_json::from_str(&body).with_context(|| {
                format!("failed to parse catalog file {}", args.input.display())
            })?;

            let mut items = Vec::new();
            let mut skipped = Vec::new();
            for (index, record) in records.into_iter().enumerate() {
                match record.id {
                    Some(id) if !id.trim().is_empty() => items.push(Item {
                        id,
                        title: record.title,
                        author: record.author,
                        topic: record.topic,
                    }),
                    _ => skipped.push(SkippedRecord {
                        index,
                        reason: "missing item id".to_string(),
                    }),
                }
            }

            let outcome = store.sync_catalog(&items)?;
            emit_json(serde_json::json!({
                "source": args.input,
                "imported": items.len(),
                "skipped": skipped,
                "sync": outcome
            }))
        }
        CatalogCommand::List => {
            let items = store.load_catalog()?;
            emit_json(serde_json::json!({ "items": items }))
        }
    }
}

fn run_recommend(args: &RecommendArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let corpus = store.load_catalog()?;
    let history = store.past_recommendation_ids()?;
    let request = RecommendRequest {
        strategy: args.strategy.into_strategy(),
        query: args.query.clone(),
        count: args.top,
    };

    let outcome =
        recommend(&corpus, &history, &request).map_err(|err| anyhow!(err.to_string()))?;

    let recorded_batch_id = if args.no_record || outcome.selected.is_empty() {
        None
    } else {
        let ids: Vec<String> =
            outcome.selected.iter().map(|entry| entry.item_id.clone()).collect();
        Some(store.record_recommendations(&ids, OffsetDateTime::now_utc())?)
    };

    emit_json(serde_json::json!({
        "recommendation": outcome,
        "recorded_batch_id": recorded_batch_id
    }))
}

fn run_history(command: HistoryCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        HistoryCommand::List => {
            let entries = store.list_history()?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
        HistoryCommand::Clear => {
            let removed = store.clear_history()?;
            emit_json(serde_json::json!({ "removed": removed }))
        }
    }
}
