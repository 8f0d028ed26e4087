//! CLI entry point for the transit reliability pipeline.
//!
//! Provides subcommands for capturing GTFS-RT snapshots, resolving them into
//! the event table, aggregating reliability, scoring stops, and publishing
//! tables to S3.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_reliability::{
    config::PipelineConfig,
    fetch::BasicClient,
    materialize::RunMode,
    output::print_json,
    pipeline::{
        FeedSources, RunInputs, aggregate_stage, capture_snapshot, load_schedule, resolve_stage,
        run_all, score_stage,
    },
    publish::publish_table,
};

const DEFAULT_TRIP_UPDATES_URL: &str = "https://www.rtd-denver.com/files/gtfs-rt/TripUpdate.pb";
const DEFAULT_VEHICLE_POSITIONS_URL: &str =
    "https://www.rtd-denver.com/files/gtfs-rt/VehiclePosition.pb";

#[derive(Parser)]
#[command(name = "transit_reliability")]
#[command(about = "Resolve GTFS-RT telemetry into reliability tables and stop priorities", long_about = None)]
struct Cli {
    /// Optional JSON config file (overrides defaults; env vars override it)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DateArg {
    /// Service date treated as "today" (defaults to the agency-local date)
    #[arg(long, value_name = "YYYY-MM-DD")]
    today: Option<NaiveDate>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch both GTFS-RT feeds and append normalized snapshot CSVs
    Capture {
        /// TripUpdates file or URL
        #[arg(long, default_value = DEFAULT_TRIP_UPDATES_URL)]
        trip_updates: String,

        /// VehiclePositions file or URL
        #[arg(long, default_value = DEFAULT_VEHICLE_POSITIONS_URL)]
        vehicle_positions: String,

        /// Directory holding snapshot CSVs
        #[arg(short, long, default_value = "data/snapshots")]
        snapshot_dir: PathBuf,

        /// Seconds between snapshots
        #[arg(short = 'r', long, default_value_t = 60)]
        sample_rate: u64,

        /// Number of snapshots to collect (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 1)]
        num_samples: usize,
    },
    /// Resolve captured snapshots into the event table
    Resolve {
        #[arg(long, default_value = "incremental")]
        mode: RunMode,

        #[arg(short, long, default_value = "data/snapshots")]
        snapshot_dir: PathBuf,

        /// Expanded stop-times CSV
        #[arg(long)]
        schedule: Option<PathBuf>,

        #[command(flatten)]
        date: DateArg,
    },
    /// Rebuild stop-hour and route-day reliability tables
    Aggregate {
        #[arg(long, default_value = "incremental")]
        mode: RunMode,

        /// Per stop-hour headway CSV
        #[arg(long)]
        headways: Option<PathBuf>,

        /// Daily weather CSV
        #[arg(long)]
        weather: Option<PathBuf>,

        #[command(flatten)]
        date: DateArg,
    },
    /// Rebuild the stop priority table
    Score {
        /// Per-stop vulnerability / crash-proximity CSV
        #[arg(long)]
        inputs: Option<PathBuf>,

        #[command(flatten)]
        date: DateArg,
    },
    /// Resolve, aggregate and score in one go
    Run {
        #[arg(long, default_value = "incremental")]
        mode: RunMode,

        #[arg(short, long, default_value = "data/snapshots")]
        snapshot_dir: PathBuf,

        #[arg(long)]
        schedule: Option<PathBuf>,

        #[arg(long)]
        headways: Option<PathBuf>,

        #[arg(long)]
        weather: Option<PathBuf>,

        #[arg(long)]
        inputs: Option<PathBuf>,

        #[command(flatten)]
        date: DateArg,
    },
    /// Upload a table's committed partitions to S3
    Publish {
        /// Table name, e.g. "resolved_events" or "stop_priority"
        #[arg(value_name = "TABLE")]
        table: String,

        /// S3 bucket name (e.g., "my-bucket")
        #[arg(long)]
        s3_bucket: String,

        /// Key prefix inside the bucket
        #[arg(long, default_value = "marts")]
        prefix: String,

        /// Gzip compress CSV files before uploading to S3
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/transit_reliability.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_reliability.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(LevelFilter::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive(LevelFilter::DEBUG.into()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;
    info!(
        table_root = %config.table_root.display(),
        timezone = %config.timezone,
        "Configuration loaded"
    );

    let today = |arg: &DateArg| {
        arg.today
            .unwrap_or_else(|| Utc::now().with_timezone(&config.timezone).date_naive())
    };

    match cli.command {
        Commands::Capture {
            trip_updates,
            vehicle_positions,
            snapshot_dir,
            sample_rate,
            num_samples,
        } => {
            let sources = FeedSources {
                trip_updates,
                vehicle_positions,
            };
            capture_loop(&config, &sources, &snapshot_dir, sample_rate, num_samples).await?;
        }
        Commands::Resolve {
            mode,
            snapshot_dir,
            schedule,
            date,
        } => {
            let schedule = load_schedule(schedule.as_deref(), &config)?;
            let summary = resolve_stage(&config, mode, today(&date), &snapshot_dir, &schedule)?;
            print_json(&summary)?;
        }
        Commands::Aggregate {
            mode,
            headways,
            weather,
            date,
        } => {
            let report = aggregate_stage(
                &config,
                mode,
                today(&date),
                headways.as_deref(),
                weather.as_deref(),
            )
            .await?;
            print_json(&report)?;
        }
        Commands::Score { inputs, date } => {
            let summary = score_stage(&config, today(&date), inputs.as_deref())?;
            print_json(&summary)?;
        }
        Commands::Run {
            mode,
            snapshot_dir,
            schedule,
            headways,
            weather,
            inputs,
            date,
        } => {
            let run_inputs = RunInputs {
                snapshot_dir,
                schedule,
                headways,
                weather,
                score_inputs: inputs,
            };
            let report = run_all(&config, mode, today(&date), &run_inputs).await?;
            print_json(&report)?;
        }
        Commands::Publish {
            table,
            s3_bucket,
            prefix,
            gzip,
        } => {
            if s3_bucket.is_empty() {
                info!("S3 bucket not specified, skipping upload");
            } else {
                publish_table(&config.store(), &table, &s3_bucket, &prefix, gzip).await?;
            }
        }
    }

    Ok(())
}

/// Captures snapshots at a fixed interval. Capture failures are logged and
/// the loop continues with the next snapshot.
#[tracing::instrument(skip(config, sources, snapshot_dir), fields(snapshot_dir = %snapshot_dir.display()))]
async fn capture_loop(
    config: &PipelineConfig,
    sources: &FeedSources,
    snapshot_dir: &Path,
    sample_rate: u64,
    num_samples: usize,
) -> Result<()> {
    let client = BasicClient::new()?;
    let filter = config.record_filter();

    if num_samples == 0 {
        info!(sample_rate, "Sampling infinitely. Press Ctrl+C to stop.");
    } else {
        info!(num_samples, sample_rate, "Starting snapshot collection");
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(sample_rate.max(1)));
    let mut sample_count = 0;
    loop {
        // Check if we've reached the sample limit (0 = infinite)
        if num_samples > 0 && sample_count >= num_samples {
            break;
        }
        interval.tick().await;
        sample_count += 1;

        match capture_snapshot(&client, sources, &filter, snapshot_dir, Utc::now()).await {
            Ok(stats) if stats.is_error() => {
                error!(
                    sample = sample_count,
                    error_type = stats.error_type.as_deref().unwrap_or_default(),
                    "Snapshot captured with errors"
                );
            }
            Ok(_) => {}
            Err(e) => error!(sample = sample_count, error = %e, "Snapshot capture failed"),
        }
    }

    Ok(())
}
