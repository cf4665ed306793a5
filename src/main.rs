//! CLI entry point for the GTFS-RT harvester.
//!
//! `harvest` polls every configured transit mode forever, `once` runs a single
//! cycle, and `modes` prints the mode table that would be used.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gtfs_rt_harvester::{
    clock::{Clock, SystemClock},
    fetch::BasicClient,
    infra::tfnsw::{DEFAULT_API_BASE, DEFAULT_TOKEN_URL, TfnswFeedFetcher, TfnswTokenSource},
    ingest::{DEFAULT_TIMETABLE_EVERY, HarvestConfig, Harvester, TimetablePolicy},
    modes::ModeTable,
    publish::SnapshotWriter,
    report::CycleReport,
    token::TokenManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_harvester")]
#[command(about = "Continually harvests GTFS-realtime snapshots into a directory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll all modes on a fixed cadence until interrupted
    Harvest {
        #[command(flatten)]
        args: HarvestArgs,
    },
    /// Run a single cycle and exit
    Once {
        #[command(flatten)]
        args: HarvestArgs,
    },
    /// Print the mode table
    Modes {
        /// JSON mode table (defaults to the built-in table)
        #[arg(long, value_name = "FILE")]
        modes: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TimetableSchedule {
    /// Every `--timetable-every` cycles
    Cycles,
    /// Once per UTC day
    Daily,
}

#[derive(Args)]
struct HarvestArgs {
    /// Client ID (API key) used to obtain access tokens
    #[arg(short = 'c', long, env = "TFNSW_CLIENT_ID")]
    client_id: String,

    /// Client secret (shared secret) used to obtain access tokens
    #[arg(short = 's', long, env = "TFNSW_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// Output directory for feed files
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Seconds between the start of consecutive cycles
    #[arg(short, long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    frequency: u64,

    /// Refresh the token when it expires within this many seconds [default: 5 x frequency]
    #[arg(long, value_name = "SECS")]
    refresh_margin: Option<u64>,

    /// How the timetable refresh is scheduled
    #[arg(long, value_enum, default_value_t = TimetableSchedule::Cycles)]
    timetable_policy: TimetableSchedule,

    /// Cycles per timetable refresh window
    #[arg(long, default_value_t = DEFAULT_TIMETABLE_EVERY, value_parser = clap::value_parser!(u32).range(1..))]
    timetable_every: u32,

    /// JSON mode table (defaults to the built-in table)
    #[arg(long, value_name = "FILE")]
    modes: Option<PathBuf>,

    /// Modes fetched concurrently [default: one per mode]
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    concurrency: Option<u64>,

    /// Milliseconds to pause between requests for the same mode
    #[arg(long, default_value_t = 1000)]
    request_spacing_ms: u64,

    /// Base URL of the GTFS API
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// OAuth2 token endpoint
    #[arg(long, default_value = DEFAULT_TOKEN_URL)]
    token_url: String,

    /// CSV file to append per-cycle results to
    #[arg(long, value_name = "CSV")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _log_guard = init_tracing()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest { args } => {
            let shutdown = shutdown_on_signal();
            let mut harvester = build_harvester(&args).await?;
            harvester.run(shutdown).await;
        }
        Commands::Once { args } => {
            let shutdown = shutdown_on_signal();
            let mut harvester = build_harvester(&args).await?;
            let summary = harvester.run_cycle(&shutdown).await;
            if let Some(e) = summary.auth_error {
                bail!(e);
            }
        }
        Commands::Modes { modes } => {
            let table = load_modes(modes.as_deref())?;
            for mode in table.iter() {
                let kinds: Vec<_> = mode.capabilities().map(|k| k.as_str()).collect();
                info!(
                    mode = %mode.key,
                    api_path = %mode.api_path,
                    kinds = %kinds.join(","),
                    "Mode"
                );
            }
        }
    }

    Ok(())
}

/// Colored stderr plus a daily-rolled JSON log file.
fn init_tracing() -> Result<WorkerGuard> {
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/gtfs_rt_harvester.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_harvester.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    Ok(file_guard)
}

fn load_modes(path: Option<&Path>) -> Result<ModeTable> {
    match path {
        Some(path) => ModeTable::load(path)
            .with_context(|| format!("failed to load mode table from {}", path.display())),
        None => Ok(ModeTable::builtin()),
    }
}

type TfnswHarvester = Harvester<TfnswTokenSource<BasicClient>, TfnswFeedFetcher<BasicClient>>;

async fn build_harvester(args: &HarvestArgs) -> Result<TfnswHarvester> {
    let modes = load_modes(args.modes.as_deref())?;

    let writer = SnapshotWriter::new(&args.output_dir);
    writer
        .prepare()
        .await
        .with_context(|| format!("output directory {} is not usable", args.output_dir.display()))?;

    let interval = Duration::from_secs(args.frequency);
    let mut config = HarvestConfig::new(interval);
    if let Some(margin) = args.refresh_margin {
        config.refresh_margin = Duration::from_secs(margin);
    }
    config.timetable = match args.timetable_policy {
        TimetableSchedule::Cycles => TimetablePolicy::EveryCycles(args.timetable_every),
        TimetableSchedule::Daily => TimetablePolicy::Daily,
    };
    config.concurrency = args
        .concurrency
        .map_or(modes.len(), |c| usize::try_from(c).unwrap_or(usize::MAX));
    config.request_spacing = Duration::from_millis(args.request_spacing_ms);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tokens = TokenManager::new(
        TfnswTokenSource::new(
            BasicClient::new()?,
            &args.token_url,
            &args.client_id,
            &args.client_secret,
        ),
        Arc::clone(&clock),
    );
    let fetcher = TfnswFeedFetcher::new(
        BasicClient::new()?,
        &args.api_base,
        modes.clone(),
        &args.output_dir,
    );

    let mut harvester = Harvester::new(config, modes, tokens, Arc::new(fetcher), writer, clock);
    if let Some(report) = &args.report {
        info!(path = %report.display(), "Appending cycle results to report");
        harvester = harvester.with_report(CycleReport::new(report));
    }
    Ok(harvester)
}

/// Exit status used when a second signal forces the process down (128 + SIGINT).
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, PartialEq, Eq)]
enum SignalAction {
    Stop,
    ForceExit,
}

/// The first signal asks for a graceful stop; any later one forces an exit.
fn on_signal(token: &CancellationToken) -> SignalAction {
    if token.is_cancelled() {
        SignalAction::ForceExit
    } else {
        token.cancel();
        SignalAction::Stop
    }
}

/// Cancels the returned token on Ctrl+C (and SIGTERM on Unix). A second
/// signal exits immediately, abandoning in-flight downloads.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        loop {
            wait_for_signal().await;
            match on_signal(&trigger) {
                SignalAction::Stop => {
                    info!("Stop requested, finishing in-flight work (signal again to force exit)")
                }
                SignalAction::ForceExit => {
                    warn!("Second stop signal, exiting without finishing in-flight work");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
        }
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, relying on Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
