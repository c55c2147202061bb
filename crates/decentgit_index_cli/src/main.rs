//! decentgit-indexer CLI: poll the ledger, replay attestations, query derived refs.

use clap::{Args, Parser, Subcommand};
use decentgit_index::config::IndexerConfig;
use decentgit_index::{state_digest, NodeClient, RefRow, ReplayEngine, Scheduler, StateStore};
use std::path::PathBuf;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    match cli.command {
        Command::Run => run_poller(&config),
        Command::Sync(args) => run_sync(&config, args),
        Command::Refs(args) => run_refs(&config, args),
        Command::Head(args) => run_head(&config, args),
        Command::Checkpoint => run_checkpoint(&config),
        Command::Digest => run_digest(&config),
    }
}

#[derive(Parser)]
#[command(name = "decentgit-indexer")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Replay signed DeCentGit ref attestations from the ledger into a local ref table")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

/// Flags override `DECENTGIT_*` environment variables, which override defaults.
#[derive(Args)]
struct GlobalArgs {
    /// Ledger node base URL.
    #[arg(long, global = true)]
    node_url: Option<String>,
    /// SQLite database holding refs and the checkpoint.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    poll_interval_secs: Option<u64>,
    #[arg(long, global = true)]
    fetch_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the node forever (Ctrl-C stops between cycles).
    Run,
    /// Run replay cycles once (or `--cycles N` times) and print the reports.
    Sync(SyncArgs),
    /// List derived refs.
    Refs(RefsArgs),
    /// Print the current head of one ref (all zeros if never attested).
    Head(HeadArgs),
    /// Print the last fully processed block index.
    Checkpoint,
    /// Print the SHA-256 digest of the derived state.
    Digest,
}

#[derive(Parser)]
struct SyncArgs {
    #[arg(long, default_value_t = 1)]
    cycles: u64,
}

#[derive(Parser)]
struct RefsArgs {
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct HeadArgs {
    #[arg(long)]
    repo: String,
    #[arg(long = "ref")]
    ref_name: String,
}

fn load_config(args: &GlobalArgs) -> Result<IndexerConfig, Box<dyn std::error::Error>> {
    let mut config = IndexerConfig::from_env()?;
    if let Some(url) = &args.node_url {
        config.node_url = url.clone();
    }
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if let Some(secs) = args.poll_interval_secs {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.fetch_timeout_secs {
        config.fetch_timeout = Duration::from_secs(secs);
    }
    config.validate()?;
    Ok(config)
}

fn build_scheduler(
    config: &IndexerConfig,
) -> Result<Scheduler<NodeClient>, Box<dyn std::error::Error>> {
    let store = StateStore::open(&config.db_path)?;
    let client = NodeClient::new(config.fetch_config())?;
    let engine = ReplayEngine::new(client, store);
    Ok(Scheduler::new(engine, config.poll_interval))
}

fn run_poller(config: &IndexerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = build_scheduler(config)?;
    info!(
        node = %config.node_url,
        db = %config.db_path.display(),
        checkpoint = scheduler.engine().store().get_checkpoint()?,
        "indexer started"
    );
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(scheduler.run(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; stopping after the current cycle");
        } else {
            std::future::pending::<()>().await;
        }
    }));
    Ok(())
}

fn run_sync(config: &IndexerConfig, args: SyncArgs) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = build_scheduler(config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let succeeded = rt.block_on(scheduler.run_cycles(args.cycles, |report| {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "could not encode cycle report"),
        }
    }));
    if succeeded < args.cycles {
        return Err(format!("{} of {} cycles failed", args.cycles - succeeded, args.cycles).into());
    }
    Ok(())
}

fn run_refs(config: &IndexerConfig, args: RefsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = StateStore::open(&config.db_path)?;
    let rows = store.list_refs(args.repo.as_deref())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in &rows {
        println!("{}", format_row(row));
    }
    Ok(())
}

fn format_row(row: &RefRow) -> String {
    let updated = OffsetDateTime::from_unix_timestamp(row.updated_at)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| row.updated_at.to_string());
    format!(
        "{}\t{}\t{}\t{}",
        row.repo_id, row.ref_name, row.commit_hash, updated
    )
}

fn run_head(config: &IndexerConfig, args: HeadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = StateStore::open(&config.db_path)?;
    println!("{}", store.get_head(&args.repo, &args.ref_name)?);
    Ok(())
}

fn run_checkpoint(config: &IndexerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = StateStore::open(&config.db_path)?;
    println!("{}", store.get_checkpoint()?);
    Ok(())
}

fn run_digest(config: &IndexerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = StateStore::open(&config.db_path)?;
    println!("{}", state_digest(&store)?);
    Ok(())
}
