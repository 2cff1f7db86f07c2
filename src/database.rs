use std::error::Error as _;
use std::net::IpAddr;
use std::time::Duration;

use clap::Args;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info, info_span, instrument, warn, Instrument as _};

use crate::probe::{Connector, ProbeError, ServerStats, Session};

const APP_NAME: &str = concat!(env!("CARGO_PKG_NAME"), " (", env!("CARGO_PKG_VERSION"), ")");

const MAX_CONNECTIONS_QUERY: &str =
    "SELECT setting AS max_conn FROM pg_settings WHERE name = 'max_connections'";
const ACTIVE_CONNECTIONS_QUERY: &str =
    "SELECT COUNT(*) AS num_connection FROM pg_stat_activity WHERE client_addr IS NOT NULL";

/// SQLSTATE classes libpq-based drivers report as operational errors, retried like a
/// failed connection: 08 connection exception, 26 invalid statement name, 27 triggered
/// data change violation, 28 invalid authorization, 34 invalid cursor name, 40
/// transaction rollback, the 5x range (insufficient resources, program limits, object
/// state, operator intervention, system errors) and HV foreign data wrapper errors.
const CONNECTION_SQLSTATE_CLASSES: [&str; 12] = [
    "08", "26", "27", "28", "34", "40", "53", "54", "55", "57", "58", "HV",
];

#[derive(Args)]
#[group(skip)]
pub(crate) struct Config {
    /// Database host name, resolved on every probe cycle
    #[arg(env, long)]
    pub db_host: String,

    /// Database port
    #[arg(env, long, default_value_t = 5432)]
    db_port: u16,

    /// Database user
    #[arg(env, long, default_value = "postgres")]
    db_user: String,

    /// Database name
    #[arg(env, long, default_value = "postgres")]
    db_name: String,

    /// Database password
    #[arg(env, long, hide_env_values = true)]
    db_password: Option<String>,

    /// Table receiving probe rows, must have a text `name` column
    #[arg(env, long, default_value = "test")]
    db_table: String,

    /// Connection establishment timeout
    #[arg(env, long, default_value = "1s")]
    connect_timeout: humantime::Duration,

    /// Idle time before TCP keepalive probes are sent
    #[arg(env, long, default_value = "3s")]
    keepalives_idle: humantime::Duration,

    /// Interval between TCP keepalive probes
    #[arg(env, long, default_value = "1s")]
    keepalives_interval: humantime::Duration,

    /// Unanswered TCP keepalive probes before the connection is considered dead
    #[arg(env, long, default_value_t = 2)]
    keepalives_count: u32,

    /// Connect to the address resolved for the cycle instead of the host name
    #[arg(env, long)]
    connect_to_resolved_ip: bool,
}

pub(crate) struct PgConnector {
    pg_config: tokio_postgres::Config,
    insert_statement: String,
    close_timeout: Duration,
    connect_to_resolved_ip: bool,
}

impl PgConnector {
    pub(crate) fn new(config: &Config) -> Self {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.db_host)
            .port(config.db_port)
            .user(&config.db_user)
            .dbname(&config.db_name)
            .application_name(APP_NAME)
            .connect_timeout(*config.connect_timeout)
            .keepalives(true)
            .keepalives_idle(*config.keepalives_idle)
            .keepalives_interval(*config.keepalives_interval)
            .keepalives_retries(config.keepalives_count);
        if let Some(password) = &config.db_password {
            pg_config.password(password);
        }

        let insert_statement = format!(
            "INSERT INTO {} (name) VALUES ($1)",
            quote_ident(&config.db_table)
        );

        Self {
            pg_config,
            insert_statement,
            close_timeout: *config.connect_timeout,
            connect_to_resolved_ip: config.connect_to_resolved_ip,
        }
    }

    fn config_for(&self, resolved_ip: &str) -> tokio_postgres::Config {
        let mut pg_config = self.pg_config.clone();
        if self.connect_to_resolved_ip {
            match resolved_ip.parse::<IpAddr>() {
                Ok(addr) => {
                    pg_config.hostaddr(addr);
                }
                Err(err) => {
                    warn!(msg = "not an IP address, connecting by host name", resolved_ip, %err);
                }
            }
        }
        pg_config
    }
}

impl Connector for PgConnector {
    type Session = PgSession;

    #[instrument(skip(self), name = "pg_connect")]
    async fn connect(&self, resolved_ip: &str) -> Result<Self::Session, ProbeError> {
        let (client, connection) = self
            .config_for(resolved_ip)
            .connect(NoTls)
            .await
            .map_err(|err| ProbeError::Connection(err.into()))?;

        let connection_task = tokio::spawn(
            async move {
                if let Err(err) = connection.await {
                    error!(kind = "connection", %err);
                }
            }
            .instrument(info_span!("pg_connection")),
        );

        Ok(PgSession {
            client,
            connection_task,
            insert_statement: self.insert_statement.clone(),
            close_timeout: self.close_timeout,
        })
    }
}

pub(crate) struct PgSession {
    client: Client,
    connection_task: JoinHandle<()>,
    insert_statement: String,
    close_timeout: Duration,
}

impl Session for PgSession {
    async fn exchange(&mut self, name: &str) -> Result<ServerStats, ProbeError> {
        let transaction = self.client.transaction().await.map_err(classify)?;

        transaction
            .execute(self.insert_statement.as_str(), &[&name])
            .await
            .map_err(classify)?;

        let max_connections: String = transaction
            .query_one(MAX_CONNECTIONS_QUERY, &[])
            .await
            .and_then(|row| row.try_get(0))
            .map_err(classify)?;

        let active_connections: i64 = transaction
            .query_one(ACTIVE_CONNECTIONS_QUERY, &[])
            .await
            .and_then(|row| row.try_get(0))
            .map_err(classify)?;

        transaction.commit().await.map_err(classify)?;

        Ok(ServerStats {
            max_connections,
            active_connections,
        })
    }

    async fn close(self) {
        drop(self.client);
        let mut connection_task = self.connection_task;
        match tokio::time::timeout(self.close_timeout, &mut connection_task).await {
            Ok(Ok(())) => info!(msg = "connection closed"),
            Ok(Err(err)) => error!(kind = "connection task join", %err),
            Err(_) => {
                connection_task.abort();
                warn!(msg = "connection close timed out, aborted");
            }
        }
    }
}

/// Sorts a client error into connection-level and statement-level failures.
pub(crate) fn classify(err: tokio_postgres::Error) -> ProbeError {
    if is_connection_error(&err) {
        ProbeError::Connection(err.into())
    } else {
        ProbeError::Statement(err.into())
    }
}

fn is_connection_error(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    if let Some(code) = err.code() {
        return is_connection_sqlstate(code.code());
    }
    err.source()
        .is_some_and(|source| source.is::<std::io::Error>())
}

fn is_connection_sqlstate(code: &str) -> bool {
    CONNECTION_SQLSTATE_CLASSES
        .iter()
        .any(|&class| code.starts_with(class))
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
