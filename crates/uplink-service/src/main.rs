//! Uplink - durable telemetry collector and uploader.
//!
//! Run with: `cargo run -p uplink-service -- run --simulate`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::{info, warn};

use uplink_core::{
    ApiClient, LocalJobRunner, Producer, SharedStore, TokenAuth, UploadScheduler, UploadWorker,
    WorkResult, days_to_millis, now_millis,
};
use uplink_service::{Config, HostProbe, StatusReport, SyntheticSource, format_batches};
use uplink_store::Store;

/// Uplink - durable telemetry collector and uploader.
#[derive(Parser, Debug)]
#[command(name = "uplink")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Ingestion API base URL (overrides config).
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler in the foreground until Ctrl-C.
    Run {
        /// Feed the producer from a synthetic sensor.
        #[arg(long)]
        simulate: bool,
    },

    /// Perform one upload run now.
    Upload,

    /// Show pending counts and upload preferences.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Delete uploaded rows older than the retention window.
    Purge {
        /// Retention in days (overrides config).
        #[arg(long)]
        days: Option<u32>,
    },

    /// Update upload preferences.
    Prefs {
        /// Upload only on unmetered networks.
        #[arg(long)]
        wifi_only: Option<bool>,
        /// Upload only while charging.
        #[arg(long)]
        requires_charging: Option<bool>,
        /// Periodic upload interval in minutes (minimum 15).
        #[arg(long)]
        interval_minutes: Option<u32>,
        /// Schedule periodic uploads.
        #[arg(long)]
        auto_upload: Option<bool>,
    },

    /// List upload-queue batches in drain order.
    Batches,

    /// Sign in and store bearer tokens.
    Login {
        /// Account email.
        #[arg(long)]
        email: String,
        /// Account password.
        #[arg(long, env = "UPLINK_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Discard stored bearer tokens.
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    if let Some(url) = args.api_url {
        config.api.base_url = url;
    }
    config.validate()?;

    match args.command {
        Command::Run { simulate } => run(&config, simulate).await,
        Command::Upload => upload(&config).await,
        Command::Status { json } => status(&config, json),
        Command::Purge { days } => purge(&config, days),
        Command::Prefs {
            wifi_only,
            requires_charging,
            interval_minutes,
            auto_upload,
        } => prefs(&config, wifi_only, requires_charging, interval_minutes, auto_upload),
        Command::Batches => batches(&config),
        Command::Login { email, password } => login(&config, &email, &password).await,
        Command::Logout => logout(&config).await,
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("uplink_service={level}").parse()?)
                .add_directive(format!("uplink_core={level}").parse()?)
                .add_directive(format!("uplink_store={level}").parse()?),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    info!("Opening database at {:?}", config.storage.path);
    Store::open(&config.storage.path)
        .with_context(|| format!("opening {}", config.storage.path.display()))
}

fn token_auth(config: &Config) -> anyhow::Result<TokenAuth> {
    Ok(TokenAuth::load(
        &config.api.base_url,
        config.api.timeout(),
        &config.api.token_file,
    )?)
}

fn build_worker(config: &Config, store: SharedStore) -> anyhow::Result<UploadWorker> {
    let client = ApiClient::new(
        &config.api.base_url,
        &config.api.study_code,
        config.api.timeout(),
    )?;
    Ok(UploadWorker::new(
        store,
        Arc::new(token_auth(config)?),
        Arc::new(client),
        config.worker_options(),
    ))
}

async fn run(config: &Config, simulate: bool) -> anyhow::Result<()> {
    let store: SharedStore = Arc::new(Mutex::new(open_store(config)?));
    let worker = Arc::new(build_worker(config, Arc::clone(&store))?);
    worker.release_abandoned().await?;
    let runner = Arc::new(LocalJobRunner::for_worker(worker, Arc::new(HostProbe)));
    let scheduler = UploadScheduler::new(runner.clone()).with_backoff(config.upload.backoff());

    let prefs = store.lock().await.preferences()?;
    match scheduler.apply_preferences(&prefs).await {
        Some(interval) => info!("Periodic uploads every {} min", interval.as_secs() / 60),
        None => info!("Automatic uploads disabled"),
    }
    scheduler.schedule_immediate(prefs.constraints()).await;

    let producer = if simulate {
        let source = Arc::new(SyntheticSource::new(
            &config.producer.sensor_kind,
            config.producer.sampling_rate_hz,
        ));
        Some(Producer::start(source, Arc::clone(&store), config.producer_options()).await?)
    } else {
        None
    };

    info!("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(producer) = producer {
        let status = producer.stop().await?;
        info!(
            collected = status.total_collected,
            dropped_by_throttle = status.dropped_by_throttle,
            dropped_on_overflow = status.dropped_on_overflow,
            "Producer stopped"
        );
    }
    scheduler.cancel_all().await;
    runner.shutdown().await;
    Ok(())
}

async fn upload(config: &Config) -> anyhow::Result<()> {
    let store: SharedStore = Arc::new(Mutex::new(open_store(config)?));
    let worker = build_worker(config, store)?;

    let result = worker.run().await;
    println!("{}", result);
    match result {
        WorkResult::Failure { reason } => bail!("upload failed: {}", reason),
        WorkResult::Retry => bail!("upload failed; retry later"),
        WorkResult::Success { .. } => Ok(()),
    }
}

fn status(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let report = StatusReport::collect(&store, config.storage.path.clone())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn purge(config: &Config, days: Option<u32>) -> anyhow::Result<()> {
    let days = days.unwrap_or(config.storage.retention_days);
    let store = open_store(config)?;
    let counts = store.purge_uploaded_before(now_millis() - days_to_millis(days))?;
    println!(
        "Purged {} rows older than {} days ({} readings, {} events, {} device states, {} batches)",
        counts.total(),
        days,
        counts.sensor_readings,
        counts.events,
        counts.device_states,
        counts.upload_batches
    );
    Ok(())
}

fn prefs(
    config: &Config,
    wifi_only: Option<bool>,
    requires_charging: Option<bool>,
    interval_minutes: Option<u32>,
    auto_upload: Option<bool>,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let mut prefs = store.preferences()?;
    if let Some(value) = wifi_only {
        prefs.wifi_only = value;
    }
    if let Some(value) = requires_charging {
        prefs.requires_charging = value;
    }
    if let Some(value) = interval_minutes {
        prefs.upload_interval_minutes = value;
    }
    if let Some(value) = auto_upload {
        prefs.auto_upload_enabled = value;
    }
    store.save_preferences(&prefs)?;

    let report = StatusReport::collect(&store, config.storage.path.clone())?;
    println!("{}", report);
    Ok(())
}

fn batches(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    println!("{}", format_batches(&store.all_batches()?));
    Ok(())
}

async fn login(config: &Config, email: &str, password: &str) -> anyhow::Result<()> {
    let auth = token_auth(config)?;
    auth.login(email, password).await?;
    println!("Signed in; tokens saved to {}", config.api.token_file.display());
    Ok(())
}

async fn logout(config: &Config) -> anyhow::Result<()> {
    token_auth(config)?.logout().await?;
    println!("Signed out");
    Ok(())
}
