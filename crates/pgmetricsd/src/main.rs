//! pgmetricsd - PostgreSQL statistics collector daemon.
//!
//! Periodically polls PostgreSQL statistics views, folds every result into
//! per-entity records and writes the resulting samples in the Prometheus
//! text exposition format, either to a file or to stdout.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgmetrics_core::collector::{
    Connection, DatabaseConnection, EmptyKeyPolicy, PgSession, StatReducer,
};
use pgmetrics_core::metrics::{MetricKind, Sample, render_text};
use pgmetrics_core::poller::{PollReport, Poller};
use pgmetrics_core::sources::SourceRegistry;

/// PostgreSQL statistics collector daemon.
#[derive(Parser)]
#[command(
    name = "pgmetricsd",
    about = "PostgreSQL statistics collector daemon",
    version = pgmetrics_core::VERSION
)]
struct Args {
    /// Collection interval in seconds.
    #[arg(short, long, default_value = "15", env = "PGMETRICS_INTERVAL")]
    interval: u64,

    /// File to write samples to (text exposition format).
    /// Written atomically on every cycle. Prints to stdout if not set.
    #[arg(short, long, env = "PGMETRICS_OUTPUT")]
    output: Option<PathBuf>,

    /// JSON file with statistic sources. Replaces the builtin set.
    #[arg(long, env = "PGMETRICS_SOURCES")]
    sources: Option<PathBuf>,

    /// What to do with rows whose key columns are all NULL or empty
    /// ("drop" or "aggregate").
    #[arg(long, default_value = "drop")]
    empty_keys: EmptyKeyPolicy,

    /// Run a single collection cycle and exit.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgmetricsd", "pgmetrics_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Describes a poll report for logging.
fn describe_report(report: &PollReport) -> String {
    let mut parts = vec![
        format!("{} sources", report.collected.len()),
        format!("{} samples", report.samples.len()),
    ];
    if !report.skipped.is_empty() {
        parts.push(format!("skipped: {}", report.skipped.join(", ")));
    }
    if !report.failed.is_empty() {
        let names: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
        parts.push(format!("failed: {}", names.join(", ")));
    }
    parts.join(", ")
}

fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Sample {
    Sample {
        name: name.to_string(),
        help: help.to_string(),
        kind: MetricKind::Gauge,
        labels,
        value,
    }
}

/// Collector health samples appended to every cycle's output.
fn self_samples(
    registry: &SourceRegistry,
    report: &PollReport,
    up: bool,
    timestamp: i64,
) -> Vec<Sample> {
    let mut samples = vec![
        gauge(
            "postgres_up",
            "Whether the PostgreSQL server answered the last poll.",
            Vec::new(),
            if up { 1.0 } else { 0.0 },
        ),
        gauge(
            "pgmetrics_poll_duration_seconds",
            "Duration of the last poll cycle, in seconds.",
            Vec::new(),
            report.elapsed.as_secs_f64(),
        ),
        gauge(
            "pgmetrics_last_poll_timestamp_seconds",
            "Unix time of the last poll cycle.",
            Vec::new(),
            timestamp as f64,
        ),
    ];

    for source in registry.sources() {
        let collected = report.collected.contains(&source.name);
        samples.push(gauge(
            "pgmetrics_source_up",
            "Whether the statistic source was collected in the last poll.",
            vec![("source".to_string(), source.name.clone())],
            if collected { 1.0 } else { 0.0 },
        ));
    }

    samples
}

/// Writes `contents` to `path` via a temporary file and rename, so readers
/// never observe a partially written file.
fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::other(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Polls over established connections; the server is up unless the main
/// connection was lost during the cycle.
fn poll_connected<C: Connection, D: Connection>(
    poller: &Poller,
    conn: &mut C,
    databases: &mut [DatabaseConnection<D>],
) -> (PollReport, bool) {
    let report = poller.poll_cluster(conn, databases);
    let up = !report.connection_lost;
    (report, up)
}

/// Runs one poll cycle, reconnecting first if needed.
fn run_cycle(session: &mut PgSession, poller: &Poller) -> (PollReport, bool) {
    match session.connections() {
        Ok((client, databases)) => {
            let (report, up) = poll_connected(poller, client, databases);
            for datname in &report.lost_databases {
                session.drop_database(datname);
            }
            if report.connection_lost {
                session.disconnect("connection lost during poll");
            }
            (report, up)
        }
        Err(e) => {
            warn!(endpoint = %session.endpoint(), error = %e, "PostgreSQL unavailable");
            (PollReport::default(), false)
        }
    }
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("pgmetricsd {} starting", pgmetrics_core::VERSION);

    let registry = match &args.sources {
        Some(path) => match SourceRegistry::load(path) {
            Ok(registry) => registry,
            Err(e) => {
                error!("Failed to load sources: {}", e);
                std::process::exit(1);
            }
        },
        None => SourceRegistry::builtin(),
    };
    info!(
        "Config: interval={}s, sources={}, empty_keys={:?}, output={}",
        args.interval,
        registry.len(),
        args.empty_keys,
        args.output
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdout".to_string())
    );

    let mut session = match PgSession::from_env() {
        Ok(session) => session,
        Err(e) => {
            error!("PostgreSQL collector: disabled ({})", e);
            print_pg_warning(&e.to_string());
            std::process::exit(1);
        }
    };

    let poller = Poller::new(
        registry,
        StatReducer::new().with_empty_keys(args.empty_keys),
    );
    let interval = Duration::from_secs(args.interval);

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut cycle_count: u64 = 0;
    info!("Starting collection loop");

    while running.load(Ordering::SeqCst) {
        let (report, up) = run_cycle(&mut session, &poller);
        cycle_count += 1;

        info!("Poll #{}: {}", cycle_count, describe_report(&report));
        if !up && let Some(error) = session.last_error() {
            warn!("PostgreSQL: {}", error);
        }

        let health = self_samples(poller.registry(), &report, up, Utc::now().timestamp());
        let mut samples = report.samples;
        samples.extend(health);
        let text = match render_text(&samples) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode samples: {}", e);
                String::new()
            }
        };

        match &args.output {
            Some(path) => match write_atomic(path, &text) {
                Ok(()) => debug!("Wrote {} samples to {}", samples.len(), path.display()),
                Err(e) => error!("Failed to write {}: {}", path.display(), e),
            },
            None => print!("{}", text),
        }

        if args.once {
            break;
        }

        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutdown complete");
}

/// Prints a colored PostgreSQL warning with configuration hints.
fn print_pg_warning(error: &str) {
    // ANSI colors: red for error, yellow for hints, reset after
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}PostgreSQL: {error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Configure connection with environment variables:");
    eprintln!("    export PGHOST=localhost");
    eprintln!("    export PGPORT=5432");
    eprintln!("    export PGUSER=postgres");
    eprintln!("    export PGPASSWORD=secret");
    eprintln!("    export PGDATABASE=postgres{RESET}");
}
