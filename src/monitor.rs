use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument as _};

use crate::probe::{Connector, Prober};
use crate::resolver::Resolve;

pub(crate) struct Schedule {
    /// Delay after each probe.
    pub interval: Duration,
    /// Delay after a failed resolution.
    pub resolve_retry_delay: Duration,
}

/// Returns `true` if shutdown was requested before `duration` elapsed.
async fn sleep_or_shutdown(duration: Duration, shutdown_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown_token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

pub(crate) fn periodic_probe<R, C>(
    host: String,
    resolver: R,
    prober: Prober<C>,
    schedule: Schedule,
    shutdown_token: CancellationToken,
) -> JoinHandle<()>
where
    R: Resolve + Send + Sync + 'static,
    C: Connector + Send + Sync + 'static,
{
    tokio::spawn(
        async move {
            info!(status = "started", host);

            let mut cycle: u64 = 0;
            while !shutdown_token.is_cancelled() {
                cycle += 1;
                let delay = async {
                    match resolver.resolve(&host).await {
                        Some(ip) => {
                            let outcome = prober.probe(&ip).await;
                            info!(msg = "cycle done", ?outcome);
                            schedule.interval
                        }
                        None => {
                            warn!(msg = "failed to resolve IP", host);
                            schedule.resolve_retry_delay
                        }
                    }
                }
                .instrument(info_span!("cycle", cycle))
                .await;

                if sleep_or_shutdown(delay, &shutdown_token).await {
                    break;
                }
            }

            info!(status = "terminating");
        }
        .instrument(info_span!("periodic_probe")),
    )
}
