mod config;
mod engine;
mod error;
mod exchange;
mod indicator;
mod math;
mod model;
mod pattern;
mod pipeline;
mod single_flight;
mod storage;
mod sync;

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use engine::{CalcOutcome, IndicatorEngine};
use exchange::binance::BinanceKlines;
use pipeline::Pipeline;
use storage::sqlite::SqliteStorage;
use storage::{CandleStore, IndicatorStore};
use sync::{CandleSynchronizer, SyncOutcome};

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("candle sync error")]
    Sync,
    #[display("indicator engine error")]
    Engine,
    #[display("pipeline run failed")]
    Pipeline,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(
    name = "kline-pipeline",
    about = "Candle sync and incremental indicator pipeline"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Page through the full history from the listing epoch
    InitialLoad,
    /// Fetch the page following the newest stored candle
    Update,
    /// Compute indicators for candles newer than the last record
    Calculate,
    /// Continue indicator computation from the last record in batches
    Resume,
    /// Delete every indicator record and recompute from scratch
    Rebuild,
    /// Run the staged pipeline once
    Pipeline,
    /// Run the pipeline on a fixed schedule until Ctrl-C
    Serve,
    /// Print store counts and progress flags as JSON
    Status,
    /// Delete all indicator records, then all candles
    Purge,
}

struct App {
    candles: Arc<dyn CandleStore>,
    indicators: Arc<dyn IndicatorStore>,
    sync: Arc<CandleSynchronizer>,
    engine: Arc<IndicatorEngine>,
    cancel: CancellationToken,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    let app = build_app(&config).await?;

    match cli.command {
        Command::InitialLoad => {
            let outcome = app.sync.initial_load().await.change_context(AppError::Sync)?;
            print_sync(outcome);
        }
        Command::Update => {
            let outcome = app.sync.update_latest().await.change_context(AppError::Sync)?;
            print_sync(outcome);
        }
        Command::Calculate => {
            let outcome = app
                .engine
                .calculate_new_indicators()
                .await
                .change_context(AppError::Engine)?;
            print_calc(outcome);
        }
        Command::Resume => {
            let outcome = app
                .engine
                .resume_calculation()
                .await
                .change_context(AppError::Engine)?;
            print_calc(outcome);
        }
        Command::Rebuild => {
            let outcome = app
                .engine
                .recalculate_all()
                .await
                .change_context(AppError::Engine)?;
            print_calc(outcome);
        }
        Command::Pipeline => {
            let report = build_pipeline(&app).run().await;
            print!("{report}");
            if !report.success {
                return Err(Report::new(AppError::Pipeline)
                    .attach(report.failure.unwrap_or_default()));
            }
        }
        Command::Serve => serve(&app, &config).await?,
        Command::Status => status(&app).await?,
        Command::Purge => {
            let indicators = app
                .indicators
                .delete_all_indicators()
                .await
                .change_context(AppError::Storage)?;
            let candles = app
                .candles
                .delete_all_candles()
                .await
                .change_context(AppError::Storage)?;
            info!(indicators, candles, "stores purged");
            println!("deleted {indicators} indicator records and {candles} candles");
        }
    }

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

async fn build_app(config: &AppConfig) -> Result<App, Report<AppError>> {
    let db_path = config.db_path();
    let storage = Arc::new(
        SqliteStorage::open(&db_path)
            .await
            .change_context(AppError::Storage)?,
    );
    let candles: Arc<dyn CandleStore> = storage.clone();
    let indicators: Arc<dyn IndicatorStore> = storage;

    let source = Arc::new(BinanceKlines::new(
        &config.market.base_url,
        &config.market.symbol,
        config.timeframe(),
        config.market.page_limit,
    ));
    let settings = config.sync_settings().change_context(AppError::Config)?;
    let cancel = CancellationToken::new();
    let sync = Arc::new(CandleSynchronizer::new(
        source,
        Arc::clone(&candles),
        settings,
        cancel.clone(),
    ));

    let engine = Arc::new(
        IndicatorEngine::new(
            Arc::clone(&candles),
            Arc::clone(&indicators),
            config.engine.batch_size,
        )
        .change_context(AppError::Config)?,
    );

    info!(
        db = %db_path.display(),
        symbol = %config.market.symbol,
        interval = %config.timeframe(),
        "pipeline components ready"
    );

    Ok(App {
        candles,
        indicators,
        sync,
        engine,
        cancel,
    })
}

fn build_pipeline(app: &App) -> Pipeline {
    Pipeline::new(
        Arc::clone(&app.sync),
        Arc::clone(&app.engine),
        Arc::clone(&app.candles),
        Arc::clone(&app.indicators),
    )
    .with_progress(|message| info!(message, "pipeline progress"))
}

async fn serve(app: &App, config: &AppConfig) -> Result<(), Report<AppError>> {
    let pipeline = build_pipeline(app);
    let cancel = app.cancel.clone();
    let shutdown = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl+c received, shutting down");
            }
            cancel.cancel();
        }
    });

    let mut ticker = tokio::time::interval(config.schedule());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        every_secs = config.pipeline.schedule_secs,
        "scheduled pipeline started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = pipeline.run().await;
        if report.success {
            info!(run_id = %report.run_id, "scheduled pipeline run succeeded");
        } else {
            warn!(
                run_id = %report.run_id,
                failure = report.failure.as_deref().unwrap_or_default(),
                "scheduled pipeline run failed"
            );
        }
    }

    shutdown.abort();
    info!("shutdown complete");
    Ok(())
}

async fn status(app: &App) -> Result<(), Report<AppError>> {
    let candle_count = app
        .candles
        .count_candles()
        .await
        .change_context(AppError::Storage)?;
    let first_candle = app
        .candles
        .min_candle_open_time()
        .await
        .change_context(AppError::Storage)?;
    let last_candle = app
        .candles
        .max_candle_open_time()
        .await
        .change_context(AppError::Storage)?;
    let indicator_count = app
        .indicators
        .count_indicators()
        .await
        .change_context(AppError::Storage)?;
    let last_indicator = app
        .indicators
        .max_indicator_open_time()
        .await
        .change_context(AppError::Storage)?;

    let status = serde_json::json!({
        "candles": {
            "count": candle_count,
            "first_open_time": first_candle,
            "last_open_time": last_candle,
        },
        "indicators": {
            "count": indicator_count,
            "last_open_time": last_indicator,
        },
        "in_progress": {
            "sync": app.sync.is_in_progress(),
            "indicators": app.engine.is_in_progress(),
        },
    });
    let text = serde_json::to_string_pretty(&status).change_context(AppError::Runtime)?;
    println!("{text}");
    Ok(())
}

fn print_sync(outcome: SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(stats) => println!(
            "fetched {} candles over {} pages: {} saved, {} already stored, {} not closed yet",
            stats.fetched, stats.pages, stats.saved, stats.duplicates, stats.unclosed
        ),
        SyncOutcome::AlreadyRunning => println!("candle sync already in progress"),
    }
}

fn print_calc(outcome: CalcOutcome) {
    match outcome {
        CalcOutcome::Completed(stats) => println!(
            "processed {} candles: {} saved, {} skipped, {} failed",
            stats.processed, stats.saved, stats.skipped, stats.failed
        ),
        CalcOutcome::AlreadyRunning => println!("indicator calculation already in progress"),
        CalcOutcome::NoBaseline => {
            println!("no indicator records yet; run `resume` or `rebuild` first")
        }
    }
}
