use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slotsync_core::dates::{parse_date, parse_work_days};
use slotsync_sync::{Engine, EngineConfig, PgSlotStore, StoreBackend, SyncTrigger, WindowSyncRequest};
use slotsync_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "slotsync")]
#[command(about = "Portal appointment-slot synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Keep slots and runs in memory instead of Postgres.
    #[arg(long)]
    memory: bool,
}

impl StoreArgs {
    fn backend(&self) -> StoreBackend {
        if self.memory {
            StoreBackend::Memory
        } else {
            StoreBackend::Postgres
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one account over a date window.
    Sync {
        #[arg(long)]
        account: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Comma-separated work days; defaults to the account's own.
        #[arg(long, value_delimiter = ',')]
        work_days: Vec<String>,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Sync one account for a single date.
    SyncDate {
        #[arg(long)]
        account: String,
        #[arg(long)]
        date: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    Migrate,
    /// Serve the HTTP trigger surface, plus the scheduler when enabled.
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Run the daily fan-out on its cron schedule, or once with `--once`.
    Schedule {
        #[arg(long)]
        once: bool,
        #[command(flatten)]
        store: StoreArgs,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SLOTSYNC_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            account,
            from,
            to,
            work_days,
            store,
        } => {
            let engine = Engine::from_env(store.backend()).await?;
            let mut request = WindowSyncRequest::new(account, parse_date(&from)?, parse_date(&to)?);
            if !work_days.is_empty() {
                request = request.with_work_days(parse_work_days(&work_days)?);
            }
            let report = engine.orchestrator.run_window_sync(request).await;
            engine.shutdown();
            print_json(&report?)?;
        }
        Commands::SyncDate { account, date, store } => {
            let engine = Engine::from_env(store.backend()).await?;
            let report = engine.orchestrator.sync_single_date(&account, parse_date(&date)?).await;
            engine.shutdown();
            print_json(&report?)?;
        }
        Commands::Migrate => {
            let config = EngineConfig::from_env()?;
            let store = PgSlotStore::connect(&config.database_url).await?;
            slotsync_sync::migrate(store.pool()).await?;
            println!("migrations applied");
        }
        Commands::Serve { bind, store } => {
            let engine = Engine::from_env(store.backend()).await?;
            let _scheduler = if engine.config.scheduler_enabled {
                Some(engine.scheduler().start().await?)
            } else {
                None
            };
            let bind = bind.unwrap_or_else(|| engine.config.bind_addr.clone());
            let state = AppState::new(engine.orchestrator.clone(), Arc::clone(engine.orchestrator.store()));
            slotsync_web::serve(&bind, state).await?;
            engine.shutdown();
        }
        Commands::Schedule { once, store } => {
            let engine = Engine::from_env(store.backend()).await?;
            let scheduler = engine.scheduler();
            if once {
                let outcomes = scheduler.run_once(chrono::Utc::now().date_naive()).await?;
                let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
                println!("scheduled sync finished: accounts={} failed={failed}", outcomes.len());
            } else {
                let mut sched = scheduler.start().await?;
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                info!("shutting down scheduler");
                sched.shutdown().await.context("stopping scheduler")?;
            }
            engine.shutdown();
        }
    }

    Ok(())
}
