use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flakewatch_core::config::{CrawlConfig, DEFAULT_CONCURRENCY};
use flakewatch_core::crawl::Crawler;
use flakewatch_core::model::RunDetail;
use flakewatch_core::parse::{group_events, parse_file};
use flakewatch_core::report::{generate, ToolVersion};
use flakewatch_core::storage::{self, BackendKind, StoreConfig};

#[derive(Parser)]
#[command(
    name = "flakewatch",
    version,
    about = "Ingest test-runner event logs and track flake rates over time"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize one run's event log, optionally persisting it
    Report(ReportArgs),
    /// Crawl a job index and load historical run summaries
    Crawl(CrawlArgs),
}

#[derive(Args)]
struct ReportArgs {
    /// Line-oriented JSON event log (e.g. `go test -json` output)
    #[arg(long = "in")]
    input: PathBuf,
    /// Where to write the summary JSON; stdout when omitted
    #[arg(long = "out")]
    output: Option<PathBuf>,
    /// Environment name, e.g. "KVM Linux"
    #[arg(long)]
    name: String,
    /// Run identity: commit or job id
    #[arg(long)]
    details: String,
    #[arg(long, default_value = "")]
    pr: String,
    #[arg(long, default_value = "")]
    repo: String,
    /// Build stamp recorded alongside the tool version
    #[arg(long, default_value = "")]
    build: String,
    #[command(flatten)]
    db: DbArgs,
}

#[derive(Args)]
struct CrawlArgs {
    /// Dashboards JSON config file
    #[arg(long)]
    config: PathBuf,
    /// Dashboard id or job name; first configured dashboard when omitted
    #[arg(long, default_value = "")]
    dashboard: String,
    /// Base URL of the job index
    #[arg(long)]
    index_url: String,
    /// Override the dashboard's page cap
    #[arg(long)]
    max_pages: Option<usize>,
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
    #[command(flatten)]
    db: DbArgs,
}

#[derive(Args)]
struct DbArgs {
    /// Storage backend: sqlite or postgres
    #[arg(long, env = "FLAKEWATCH_DB_BACKEND")]
    db_backend: Option<String>,
    /// Database file (sqlite) or DSN (postgres)
    #[arg(long, env = "FLAKEWATCH_DB_PATH", default_value = "")]
    db_path: String,
    /// Host prepended to the postgres DSN
    #[arg(long, env = "FLAKEWATCH_DB_HOST", default_value = "")]
    db_host: String,
}

impl DbArgs {
    fn to_config(&self) -> anyhow::Result<Option<StoreConfig>> {
        let Some(backend) = self.db_backend.as_deref() else {
            return Ok(None);
        };
        let backend = match backend {
            "sqlite" => BackendKind::Sqlite,
            "postgres" => BackendKind::Postgres,
            other => bail!("unknown db backend {other:?} (expected sqlite or postgres)"),
        };
        if self.db_path.is_empty() {
            bail!("--db-path is required when a backend is selected");
        }
        Ok(Some(StoreConfig {
            backend,
            path: self.db_path.clone(),
            host: self.db_host.clone(),
        }))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    match Cli::parse().cmd {
        Command::Report(args) => run_report(args).await,
        Command::Crawl(args) => run_crawl(args).await,
    }
}

async fn run_report(args: ReportArgs) -> anyhow::Result<()> {
    let events = parse_file(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let groups = group_events(&events);
    let detail = RunDetail {
        name: args.name,
        details: args.details,
        pr: args.pr,
        repo_name: args.repo,
    };
    let version = ToolVersion::new(format!("v{}", env!("CARGO_PKG_VERSION")), args.build);
    let content = generate(detail, &groups, version);
    let summary = content.short_summary();
    info!(
        pass = content.passed.len(),
        fail = content.failed.len(),
        skip = content.skipped.len(),
        duration = content.total_duration,
        "run summarized"
    );

    let json = serde_json::to_string_pretty(&summary)?;
    match &args.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{json}"),
    }

    if let Some(cfg) = args.db.to_config()? {
        let store = storage::open(&cfg).await?;
        store.initialize().await?;
        let (run, rows) = summary.to_db_rows(chrono::Utc::now())?;
        store.set(&run, &rows).await?;
        info!(rows = rows.len(), "run persisted");
    }
    Ok(())
}

async fn run_crawl(args: CrawlArgs) -> anyhow::Result<()> {
    let cfg = CrawlConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut dashboard = if args.dashboard.is_empty() {
        cfg.dashboards[0].clone()
    } else {
        cfg.find_dashboard(&args.dashboard)
            .cloned()
            .with_context(|| format!("unknown dashboard {:?}", args.dashboard))?
    };
    if let Some(pages) = args.max_pages {
        dashboard.max_pages = pages;
    }

    let db = args
        .db
        .to_config()?
        .context("crawl requires --db-backend and --db-path")?;
    let store = storage::open(&db).await?;
    store.initialize().await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight jobs");
            ctrl_c.cancel();
        }
    });

    let crawler = Crawler::new(args.index_url, Arc::from(store))?;
    let report = crawler.run(&dashboard, args.concurrency, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
