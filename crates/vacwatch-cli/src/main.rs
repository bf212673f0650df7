use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use vacwatch_core::now_in;
use vacwatch_storage::{MemoryVacancyStore, VacancyStore};
use vacwatch_sync::report::{self, HourlyFilter, DEFAULT_GROWTH_WINDOW_HOURS, DEFAULT_TOP_N};
use vacwatch_sync::{
    connect_store, pipeline_from_config, resolve_searches, run_sync_once_from_env, SyncConfig,
    SyncRunSummary,
};

#[derive(Debug, Parser)]
#[command(name = "vacwatch")]
#[command(about = "Track hh.ru vacancy response counts over time")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the configured searches once and merge the results.
    Sync {
        /// Search URL to scrape instead of `searches.yaml`.
        #[arg(long)]
        url: Option<String>,
        /// Page limit; 0 walks until results run out (capped at 20 otherwise).
        #[arg(long)]
        pages: Option<usize>,
        /// Keep results in memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    Migrate,
    Report {
        #[command(subcommand)]
        kind: ReportKind,
    },
    /// Run the cron scheduler until interrupted.
    Watch,
}

#[derive(Debug, Subcommand)]
enum ReportKind {
    Hourly {
        #[arg(long)]
        city: Option<String>,
        #[arg(long = "specialization")]
        specializations: Vec<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        positive_only: bool,
    },
    Top {
        #[arg(long, default_value_t = DEFAULT_TOP_N)]
        limit: usize,
        #[arg(long, default_value_t = DEFAULT_GROWTH_WINDOW_HOURS)]
        hours: i64,
    },
    Pivot,
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} created={} appended={} rate_limited={} failed={}",
        summary.run_id,
        summary.totals.created,
        summary.totals.appended,
        summary.totals.rate_limited,
        summary.totals.failed
    );
    if let Some(dir) = &summary.reports_dir {
        println!("reports: {dir}");
    }
}

async fn report(kind: ReportKind) -> Result<()> {
    let config = SyncConfig::from_env();
    let offset = config.offset()?;
    let docs = connect_store(&config)
        .await?
        .list()
        .await
        .context("loading vacancy documents")?;
    let dir = config.reports_root().join(Uuid::new_v4().to_string());

    match kind {
        ReportKind::Hourly {
            city,
            specializations,
            from,
            to,
            positive_only,
        } => {
            let filter = HourlyFilter {
                city,
                specializations,
                from,
                to,
                positive_only,
            };
            let rows = report::hourly_increase(&docs, offset, &filter);
            report::write_hourly_report(&dir, &rows).await?;
            print!("{}", report::render_hourly_markdown(&rows));
        }
        ReportKind::Top { limit, hours } => {
            let window = Duration::hours(hours);
            let rows = report::fastest_growing(&docs, now_in(offset), window, limit);
            report::write_top_report(&dir, &rows, window).await?;
            print!("{}", report::render_top_markdown(&rows, window));
        }
        ReportKind::Pivot => {
            let table = report::pivot_table(&docs, offset);
            let manifest = report::export_pivot(&dir, &docs, &table).await?;
            println!(
                "pivot: vacancies={} hours={} manifest={}",
                table.rows.len(),
                table.columns.len(),
                manifest.display()
            );
        }
    }
    Ok(())
}

async fn watch() -> Result<()> {
    let config = SyncConfig::from_env();
    if !config.scheduler_enabled {
        bail!("scheduler disabled; set VACWATCH_SCHEDULER_ENABLED=1");
    }
    let searches = resolve_searches(&config, None, None).await?;
    let store: Arc<dyn VacancyStore> = Arc::new(connect_store(&config).await?);
    let pipeline = Arc::new(pipeline_from_config(config, store).await?);

    let Some(mut sched) = Arc::clone(&pipeline)
        .maybe_build_scheduler(searches)
        .await?
    else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    tracing::info!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vacwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        url: None,
        pages: None,
        memory: false,
    }) {
        Commands::Sync {
            url,
            pages,
            memory: false,
        } => {
            let summary = run_sync_once_from_env(url, pages).await?;
            print_summary(&summary);
        }
        Commands::Sync {
            url,
            pages,
            memory: true,
        } => {
            let config = SyncConfig::from_env();
            let searches = resolve_searches(&config, url, pages).await?;
            let store = Arc::new(MemoryVacancyStore::new());
            let pipeline = pipeline_from_config(config, store.clone()).await?;
            let summary = pipeline.run_once(&searches).await?;
            print_summary(&summary);
            println!("documents held in memory: {}", store.list().await?.len());
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            connect_store(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { kind } => report(kind).await?,
        Commands::Watch => watch().await?,
    }

    Ok(())
}
