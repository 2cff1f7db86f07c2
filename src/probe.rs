use std::error::Error as StdError;
use std::future::Future;
use std::time::{Duration, UNIX_EPOCH};

use clap::Args;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument as _};

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Args)]
#[group(skip)]
pub(crate) struct Config {
    /// Maximum number of connection attempts per probe cycle
    #[arg(env, long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: u32,

    /// Delay before retrying after a connection error
    #[arg(env, long, default_value = "2s")]
    retry_delay: humantime::Duration,
}

#[derive(Debug, Error)]
pub(crate) enum ProbeError {
    /// The server could not be reached or dropped the connection.
    #[error("database connection error: {0}")]
    Connection(#[source] BoxError),

    #[error("statement error: {0}")]
    Statement(#[source] BoxError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerStats {
    pub max_connections: String,
    pub active_connections: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Succeeded(ServerStats),
    Exhausted,
    Abandoned,
    Cancelled,
}

pub(crate) trait Connector {
    type Session: Session + Send;

    fn connect(
        &self,
        resolved_ip: &str,
    ) -> impl Future<Output = Result<Self::Session, ProbeError>> + Send;
}

pub(crate) trait Session {
    /// Inserts the row named `name` and reads the server statistics, in one transaction.
    fn exchange(&mut self, name: &str)
        -> impl Future<Output = Result<ServerStats, ProbeError>> + Send;

    /// Closes the connection; every opened session is closed exactly once.
    fn close(self) -> impl Future<Output = ()> + Send;
}

pub(crate) fn row_name(unix_secs: u64, ip: &str) -> String {
    format!("Test_{unix_secs}_{ip}")
}

pub(crate) struct Prober<C> {
    connector: C,
    max_retries: u32,
    retry_delay: Duration,
    shutdown_token: CancellationToken,
}

impl<C: Connector> Prober<C> {
    pub(crate) fn new(connector: C, config: &Config, shutdown_token: CancellationToken) -> Self {
        Self {
            connector,
            max_retries: config.max_retries,
            retry_delay: *config.retry_delay,
            shutdown_token,
        }
    }

    pub(crate) async fn probe(&self, ip: &str) -> ProbeOutcome {
        let timestamp = UNIX_EPOCH.elapsed().unwrap_or_default().as_secs();
        let name = row_name(timestamp, ip);
        info!(msg = "inserting data", name);

        for attempt in 1..=self.max_retries {
            let outcome = self
                .attempt(ip, &name)
                .instrument(info_span!("attempt", attempt))
                .await;
            let err = match outcome {
                Ok(stats) => {
                    info!(
                        msg = "probe succeeded",
                        name,
                        max_conn = stats.max_connections,
                        num_connection = stats.active_connections
                    );
                    return ProbeOutcome::Succeeded(stats);
                }
                Err(err @ ProbeError::Connection(_)) => err,
                Err(err @ ProbeError::Statement(_)) => {
                    error!(kind = "error during insertion", name, %err);
                    return ProbeOutcome::Abandoned;
                }
            };

            error!(kind = "database connection", attempt, %err);
            if attempt == self.max_retries {
                break;
            }
            tokio::select! {
                _ = self.shutdown_token.cancelled() => return ProbeOutcome::Cancelled,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        warn!(msg = "giving up for this cycle", attempts = self.max_retries);
        ProbeOutcome::Exhausted
    }

    async fn attempt(&self, ip: &str, name: &str) -> Result<ServerStats, ProbeError> {
        let mut session = self.connector.connect(ip).await?;
        let result = session.exchange(name).await;
        session.close().await;
        result
    }
}
