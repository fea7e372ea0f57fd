use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

use clob_engine::execution::PaperExecutionClient;
use clob_engine::feeds;
use clob_engine::strategies::StrategyRuntime;
use clob_engine::{Config, Engine};

#[derive(Debug, Parser)]
#[command(name = "clob-engine", version, about = "CLOB trading engine")]
struct Args {
    /// Config file (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Force the paper execution client
    #[arg(long)]
    dry_run: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Stop after N ticks
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Listen for JSON-lines market data on a Unix socket
    #[arg(long, conflicts_with = "replay")]
    socket: Option<PathBuf>,

    /// Replay JSON-lines market data from a file, then shut down
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Delay between replayed events, in milliseconds
    #[arg(long, requires = "replay")]
    pace_ms: Option<u64>,

    /// Output format of the shutdown report
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,

    /// Override a config option, e.g. --set risk.max_loss=250
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_process_env()?;
    for item in &args.overrides {
        let Some((key, value)) = item.split_once('=') else {
            bail!("--set expects KEY=VALUE, got '{}'", item);
        };
        config.set_option(key.trim(), value)?;
    }
    if args.dry_run {
        config.app.dry_run = true;
    }
    if let Some(level) = &args.log_level {
        config.app.log_level = level.clone();
    }
    if args.max_ticks.is_some() {
        config.engine.max_ticks = args.max_ticks;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args).context("invalid configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.app.log_level));
    fmt().with_env_filter(filter).with_target(true).with_level(true).init();

    tracing::info!(
        dry_run = config.app.dry_run,
        strategies = config.strategies.len(),
        "clob-engine starting"
    );

    if !config.app.dry_run {
        bail!("no live venue adapter is built in; run with --dry-run or app.dry_run = true");
    }

    // execution is unbounded: the paper client reports while the engine is
    // still awaiting its submit
    let (market_tx, market_rx) = flume::bounded(config.engine.channel_capacity);
    let (execution_tx, execution_rx) = flume::unbounded();

    let client = Arc::new(PaperExecutionClient::new(execution_tx, config.app.paper_fill));
    let strategies = StrategyRuntime::from_configs(&config.strategies)?;
    if strategies.is_empty() {
        tracing::warn!("No strategies enabled, engine will only track market data");
    }

    let mut engine = Engine::new(&config, client, strategies, market_rx, execution_rx);
    let shutdown = engine.shutdown_handle();

    if let Some(path) = args.socket.clone() {
        let listener = feeds::ipc::listen(path, market_tx.clone());
        tokio::spawn(feeds::supervise("ipc", market_tx.clone(), listener));
    } else if let Some(path) = args.replay.clone() {
        let pace = args.pace_ms.map(Duration::from_millis);
        let tx = market_tx.clone();
        let done = shutdown.clone();
        tokio::spawn(async move {
            let replay = feeds::replay::replay_file(&path, tx.clone(), pace);
            feeds::supervise("replay", tx.clone(), replay).await;
            while !tx.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tracing::info!("Replay consumed, shutting down");
            done.shutdown();
        });
    } else {
        tracing::warn!("No market data source given (--socket or --replay)");
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C, shutting down");
                shutdown.shutdown();
            }
        });
    }

    let result = engine.run().await;
    // the market channel stays open until the engine is done with it
    drop(market_tx);
    if let Some(path) = &args.socket {
        feeds::ipc::cleanup(path);
    }

    let report = result?;
    match args.report {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        ReportFormat::Text => {
            println!("stopped: {}", report.reason);
            println!("realized pnl: {}", report.realized_pnl);
            println!("unrealized pnl: {}", report.unrealized_pnl);
            println!(
                "signals: {} approved: {} risk rejected: {} fills: {}",
                report.stats.signals,
                report.stats.approved,
                report.stats.risk_rejections,
                report.stats.fills
            );
            if !report.is_clean() {
                let ids: Vec<String> = report.unresolved.iter().map(ToString::to_string).collect();
                println!("unresolved orders: {}", ids.join(", "));
            }
        }
    }
    Ok(())
}
