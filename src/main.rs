use anyhow::Context as _;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use futures_util::{Stream, StreamExt};
use humantime::Duration;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::low_level::signal_name;
use signal_hook_tokio::Signals;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use tracing_log::LogTracer;

mod database;
mod monitor;
mod probe;
mod resolver;

#[derive(Parser)]
#[command(about = "Periodically probes a PostgreSQL endpoint: resolve, connect, write, read")]
struct Args {
    /// Delay between probe cycles
    #[arg(env, long, default_value = "1s")]
    interval: Duration,

    /// Delay before retrying after a failed resolution
    #[arg(env, long, default_value = "1s")]
    resolve_retry_delay: Duration,

    #[command(flatten)]
    database: database::Config,

    #[command(flatten)]
    probe: probe::Config,

    #[command(flatten)]
    resolver: resolver::Config,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn init_logging(verbose: &Verbosity<InfoLevel>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(verbose.tracing_level())
        .with_target(false)
        .init();

    // tokio-postgres reports through the `log` facade.
    LogTracer::init_with_filter(verbose.log_level_filter())
        .context("error bridging log records to tracing")
}

/// Requests shutdown on the first termination signal; the current probe
/// cycle still runs to completion.
#[instrument(skip_all, name = "termination_watch")]
async fn watch_termination(
    mut signals: impl Stream<Item = i32> + Unpin,
    shutdown_token: CancellationToken,
) {
    while let Some(signal) = signals.next().await {
        let signal = signal_name(signal).unwrap_or("unknown");
        if shutdown_token.is_cancelled() {
            warn!(msg = "already shutting down, waiting for the current cycle", signal);
        } else {
            info!(msg = "termination requested", signal);
            shutdown_token.cancel();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.verbose)?;

    info!(
        status = "starting",
        host = args.database.db_host,
        interval = %args.interval,
    );

    let shutdown_token = CancellationToken::new();

    let signals = Signals::new(TERM_SIGNALS).context("error registering termination signals")?;
    let signals_handle = signals.handle();
    let watch_task = tokio::spawn(watch_termination(signals, shutdown_token.clone()));

    let prober = probe::Prober::new(
        database::PgConnector::new(&args.database),
        &args.probe,
        shutdown_token.clone(),
    );
    let schedule = monitor::Schedule {
        interval: *args.interval,
        resolve_retry_delay: *args.resolve_retry_delay,
    };
    monitor::periodic_probe(
        args.database.db_host.clone(),
        resolver::DigResolver::new(&args.resolver),
        prober,
        schedule,
        shutdown_token,
    )
    .await
    .context("error joining probe task")?;

    signals_handle.close();
    watch_task.await.context("error joining termination watch task")?;

    Ok(())
}
