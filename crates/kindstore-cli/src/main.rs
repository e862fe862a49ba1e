//! kindstore - document store inspection CLI
//!
//! The `kindstore` command works on raw rows, so it needs no knowledge of
//! the record types an application registers.
//!
//! ## Commands
//!
//! - `urn`: mint or parse URNs
//! - `get`: print one document
//! - `search`: print documents matching a query string
//! - `count`: count documents matching a query string
//! - `delete`: remove a document and print what was removed

mod telemetry;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kindstore::{Document, DocumentStore, Query, SqliteStore, StoreConfig, Urn};
use serde_json::{json, Value};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "kindstore")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and maintain a kindstore database", long_about = None)]
struct Cli {
    /// Database file (default: KINDSTORE_DB_PATH, else in-memory)
    #[arg(long, global = true, env = "KINDSTORE_DB_PATH")]
    db: Option<PathBuf>,

    /// Use substring matching instead of the full-text index
    #[arg(long, global = true)]
    no_fts: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mint or inspect URNs
    Urn {
        #[command(subcommand)]
        action: UrnAction,
    },

    /// Print the document addressed by a URN
    Get {
        urn: String,
    },

    /// Print documents of a kind matching a query
    Search {
        kind: String,

        /// Query string, e.g. "namespace=acme;state=active;match=Alice;"
        #[arg(short, long, default_value = "")]
        query: String,

        /// Sort entries, `[+|-]field`; repeatable (default: +id)
        #[arg(short, long, allow_hyphen_values = true)]
        sort: Vec<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(short, long, default_value_t = kindstore::DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Count documents of a kind matching a query
    Count {
        kind: String,

        #[arg(short, long, default_value = "")]
        query: String,
    },

    /// Delete the document addressed by a URN
    Delete {
        urn: String,

        /// Recorded in the log as the deleting user
        #[arg(long, default_value = "cli")]
        by: String,
    },
}

#[derive(Subcommand)]
enum UrnAction {
    /// Mint a new URN
    New { namespace: String, kind: String },

    /// Validate a URN and print its parts
    Parse { text: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    telemetry::init_tracing(cli.json, level);

    let mut out = std::io::stdout().lock();

    // URN commands never touch the database.
    if let Commands::Urn { action } = &cli.command {
        return cmd_urn(action, &mut out);
    }

    let store = open_store(&cli)?;
    match cli.command {
        Commands::Urn { .. } => Ok(()),
        Commands::Get { urn } => cmd_get(&store, &urn, &mut out).await,
        Commands::Search {
            kind,
            query,
            sort,
            offset,
            limit,
        } => cmd_search(&store, &kind, &query, sort, offset, limit, &mut out).await,
        Commands::Count { kind, query } => cmd_count(&store, &kind, &query, &mut out).await,
        Commands::Delete { urn, by } => cmd_delete(&store, &urn, &by, &mut out).await,
    }
}

fn open_store(cli: &Cli) -> Result<SqliteStore> {
    let mut config = StoreConfig::from_env()
        .map_err(anyhow::Error::msg)
        .context("Invalid store configuration")?;
    if let Some(db) = &cli.db {
        config.path = Some(db.clone());
    }
    if cli.no_fts {
        config.full_text = false;
    }
    SqliteStore::open(config).context("Failed to open kindstore database")
}

/// Document with `data` expanded back into JSON.
fn document_json(doc: &Document) -> Result<Value> {
    let data: Value = serde_json::from_str(&doc.data)
        .with_context(|| format!("Corrupt data column for {}", doc.urn_string()))?;
    Ok(json!({
        "urn": doc.urn_string(),
        "state": doc.state,
        "indexed_by": doc.indexed_by,
        "created_by": doc.created_by,
        "created_at": doc.created_at,
        "updated_by": doc.updated_by,
        "updated_at": doc.updated_at,
        "data": data,
    }))
}

fn parse_urn(text: &str) -> Result<Urn> {
    Urn::parse(text).with_context(|| format!("Not a valid URN: {text}"))
}

fn cmd_urn(action: &UrnAction, out: &mut dyn Write) -> Result<()> {
    match action {
        UrnAction::New { namespace, kind } => {
            let urn = Urn::new(namespace, kind).context("Cannot mint URN")?;
            writeln!(out, "{urn}")?;
        }
        UrnAction::Parse { text } => {
            let urn = parse_urn(text)?;
            writeln!(out, "namespace: {}", urn.namespace())?;
            writeln!(out, "kind:      {}", urn.kind())?;
            writeln!(out, "id:        {}", urn.id())?;
        }
    }
    Ok(())
}

async fn cmd_get(store: &dyn DocumentStore, urn: &str, out: &mut dyn Write) -> Result<()> {
    let urn = parse_urn(urn)?;
    let doc = store
        .fetch(urn.kind(), urn.id())
        .await
        .with_context(|| format!("Document not found: {urn}"))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&document_json(&doc)?)?)?;
    Ok(())
}

async fn cmd_search(
    store: &dyn DocumentStore,
    kind: &str,
    query: &str,
    sort: Vec<String>,
    offset: usize,
    limit: usize,
    out: &mut dyn Write,
) -> Result<()> {
    let mut base = Query::new().offset(offset).limit(limit);
    if !sort.is_empty() {
        base = base.sort(sort);
    }
    let query = Query::parse(query, None, base).context("Invalid query")?;

    let docs = store.search(kind, &query).await.context("Search failed")?;
    for doc in &docs {
        writeln!(out, "{}", serde_json::to_string(&document_json(doc)?)?)?;
    }
    info!(kind, matched = docs.len(), "search complete");
    Ok(())
}

async fn cmd_count(
    store: &dyn DocumentStore,
    kind: &str,
    query: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let query = Query::parse(query, None, Query::new()).context("Invalid query")?;
    let n = store.count(kind, &query).await.context("Count failed")?;
    writeln!(out, "{n}")?;
    Ok(())
}

async fn cmd_delete(
    store: &dyn DocumentStore,
    urn: &str,
    by: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let urn = parse_urn(urn)?;
    let removed = store
        .delete(urn.kind(), urn.id())
        .await
        .with_context(|| format!("Failed to delete {urn}"))?;
    info!(urn = %urn, by, "document deleted");
    writeln!(out, "{}", serde_json::to_string_pretty(&document_json(&removed)?)?)?;
    Ok(())
}
