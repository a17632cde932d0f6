mod demo;
mod render;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;

use arbiter_config::{load_config, AppConfig};
use arbiter_core::VirtualAccount;
use arbiter_engine::{ExecutionLoop, ShutdownSignal};
use arbiter_paper::PaperExchange;
use arbiter_store::Store;

#[derive(Parser)]
#[command(author, version, about = "Arbiter execution engine")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against the paper venue, waiting for external signals
    Run,
    /// Run with a randomized market and signal feed plus a live dashboard
    Demo(DemoArgs),
    /// Print a one-shot dashboard snapshot from persisted state
    State,
}

#[derive(Args)]
struct DemoArgs {
    /// Symbols the demo feed trades
    #[arg(long, value_delimiter = ',', default_value = "AAPL,GOOGL,MSFT,TSLA,AMZN")]
    symbols: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    let filter = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    telemetry::init_tracing(&filter)?;

    match cli.command {
        Commands::Run => run_engine(config, None).await,
        Commands::Demo(args) => run_engine(config, Some(args.symbols)).await,
        Commands::State => print_state(config),
    }
}

fn open_and_seed(config: &AppConfig) -> Result<Arc<Store>> {
    let store = Arc::new(
        Store::open(&config.database_path).with_context(|| {
            format!("failed to open store at {}", config.database_path.display())
        })?,
    );
    let mut seeds = config.accounts.clone();
    if seeds.is_empty() {
        // Match the sample population the system ships with.
        for va_id in ["VA001", "VA002", "VA003"] {
            seeds.push(arbiter_config::AccountSeed {
                va_id: va_id.to_string(),
                balance: Decimal::from(100_000),
            });
        }
    }
    for seed in seeds {
        if store.get_va(&seed.va_id)?.is_none() {
            store.create_va(&VirtualAccount::new(seed.va_id.clone(), seed.balance))?;
            info!(va_id = %seed.va_id, balance = %seed.balance, "virtual account created");
        }
    }
    Ok(store)
}

async fn run_engine(config: AppConfig, demo_symbols: Option<Vec<String>>) -> Result<()> {
    let store = open_and_seed(&config)?;
    let (venue, events) = PaperExchange::new("paper");
    let engine = Arc::new(
        ExecutionLoop::build(&config, Arc::clone(&store), Arc::new(venue.clone()))
            .context("failed to assemble execution loop")?,
    );
    let shutdown = engine.shutdown_signal();

    let dashboard = tokio::spawn(run_dashboard(
        Arc::clone(&engine),
        Duration::from_secs(config.dashboard.refresh_seconds),
        shutdown.clone(),
    ));

    let mut feeds = Vec::new();
    if let Some(symbols) = demo_symbols {
        let va_ids: Vec<String> = store
            .list_vas()?
            .into_iter()
            .map(|va| va.va_id)
            .collect();
        feeds.push(tokio::spawn(demo::run_price_feed(
            venue.clone(),
            symbols.clone(),
            Duration::from_millis(config.execution.monitor_poll_interval_ms),
            shutdown.clone(),
        )));
        feeds.push(tokio::spawn(demo::run_signal_feed(
            engine.queue(),
            venue.clone(),
            va_ids,
            symbols,
            shutdown.clone(),
        )));
        info!("demo feeds started, press ctrl-c to stop");
    } else {
        info!("engine running, press ctrl-c to stop");
    }

    Arc::clone(&engine)
        .run(events)
        .await
        .context("execution loop failed")?;

    for feed in feeds {
        let _ = feed.await;
    }
    let _ = dashboard.await;
    Ok(())
}

async fn run_dashboard(
    engine: Arc<ExecutionLoop>,
    refresh: Duration,
    shutdown: ShutdownSignal,
) {
    while shutdown.sleep(refresh).await {
        match engine.snapshot(Utc::now()) {
            Ok(snapshot) => println!("{}", render::render_snapshot(&snapshot)),
            Err(err) => tracing::error!(error = %err, "dashboard snapshot failed"),
        }
    }
}

fn print_state(config: AppConfig) -> Result<()> {
    let store = Store::open(&config.database_path).with_context(|| {
        format!("failed to open store at {}", config.database_path.display())
    })?;
    let now = Utc::now();
    println!("virtual accounts:");
    for va in store.list_vas()? {
        let cooldown = va
            .cooldown_until
            .filter(|until| *until > now)
            .map(|until| format!(" cooldown_until={until}"))
            .unwrap_or_default();
        println!(
            "  {} balance={} realized={} wins={} losses={} streak={}{}",
            va.va_id, va.balance, va.realized_pnl, va.wins, va.losses, va.consecutive_losses,
            cooldown
        );
    }
    println!("open positions:");
    for position in store.list_positions()? {
        println!(
            "  {} {} {:?} qty={} entry={} stop={}",
            position.va_id,
            position.symbol,
            position.side,
            position.qty,
            position.avg_entry_price,
            position.stop_loss_price
        );
    }
    println!("recent incidents:");
    for incident in store.list_incidents(10)? {
        println!(
            "  [{}] {} {}",
            incident.created_at.format("%Y-%m-%d %H:%M:%S"),
            incident.kind,
            incident.detail
        );
    }
    Ok(())
}
