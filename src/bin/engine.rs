use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use telemetry_alarms::{
    AlarmRunner, AlarmScheduler,
    config::{Config, StorageConfig, read_config_file},
    dispatcher::NotificationDispatcher,
    metrics::MemoryMetrics,
    series::TimeSeriesReader,
    storage::{AlarmRepository, MeasurementStore, memory::MemoryBackend},
    util,
};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (defaults to $ALARM_CONFIG or ./config.json)
    #[arg(short, long)]
    file: Option<String>,

    /// Run a single pass over the due alarms and exit
    #[arg(long)]
    once: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("telemetry_alarms", LevelFilter::DEBUG),
        ("alarm_engine", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

type Backends = (Arc<dyn AlarmRepository>, Arc<dyn MeasurementStore>);

async fn open_storage(config: &Config) -> anyhow::Result<Backends> {
    let storage = match util::get_database_path() {
        Some(path) => Some(StorageConfig::Sqlite { path }),
        None => config.storage.clone(),
    };

    match storage {
        None | Some(StorageConfig::None) => {
            warn!("no storage configured, alarms are kept in memory only");
            let backend = Arc::new(MemoryBackend::new());
            let repository: Arc<dyn AlarmRepository> = backend.clone();
            let measurements: Arc<dyn MeasurementStore> = backend;
            Ok((repository, measurements))
        }
        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path }) => {
            let backend = Arc::new(
                telemetry_alarms::storage::sqlite::SqliteBackend::new(&path)
                    .await
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            );
            let repository: Arc<dyn AlarmRepository> = backend.clone();
            let measurements: Arc<dyn MeasurementStore> = backend;
            Ok((repository, measurements))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => {
            anyhow::bail!("sqlite storage requested but the 'storage-sqlite' feature is disabled")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let path = args.file.unwrap_or_else(util::get_config_path);
    let mut config =
        read_config_file(&path).with_context(|| format!("failed to read config {path}"))?;
    if let Some(interval) = util::get_interval() {
        config.alarms.interval = interval;
    }

    let (repository, measurements) = open_storage(&config).await?;
    let metrics = Arc::new(MemoryMetrics::new());

    let reader = TimeSeriesReader::new(measurements, config.retentions.clone())
        .with_max_points(config.max_points);
    let dispatcher = NotificationDispatcher::new(repository.clone(), reqwest::Client::new());
    let runner = AlarmRunner::new(repository, reader, dispatcher, metrics.clone());

    let scheduler = AlarmScheduler::new(runner, config.alarms.interval(), config.alarms.cooldown())?;

    if args.once {
        let summary = scheduler.run_once().await?;
        info!("evaluated {} alarms", summary.len());
    } else {
        scheduler.start();
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutting down");
        scheduler.stop();
    }

    info!("counters: {:?}", metrics.snapshot());
    Ok(())
}
