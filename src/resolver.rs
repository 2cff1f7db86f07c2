use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use clap::Args;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

/// Exit status of `timeout` when the wrapped command timed out.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Extra time granted to the `timeout` wrapper before the child gets killed.
const GUARD_GRACE: Duration = Duration::from_secs(1);

#[derive(Args)]
#[group(skip)]
pub(crate) struct Config {
    /// Timeout of the DNS lookup command
    #[arg(env, long, default_value = "1s")]
    dig_timeout: humantime::Duration,

    /// DNS lookup program, invoked as `<program> +short <host>`
    #[arg(env, long, default_value = "dig")]
    dig_command: String,

    /// Program enforcing the lookup timeout, invoked as `<program> <seconds> <lookup>`
    #[arg(env, long, default_value = "timeout")]
    timeout_command: String,
}

#[derive(Debug, Error)]
pub(crate) enum ResolveError {
    #[error("error spawning lookup command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("lookup timed out")]
    Timeout,

    #[error("lookup command failed ({status}): {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

pub(crate) trait Resolve {
    /// Resolves `host` to an IPv4 address, logging failures.
    fn resolve(&self, host: &str) -> impl Future<Output = Option<String>> + Send;
}

pub(crate) struct DigResolver {
    timeout: Duration,
    dig_command: String,
    timeout_command: String,
}

impl DigResolver {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            timeout: *config.dig_timeout,
            dig_command: config.dig_command.clone(),
            timeout_command: config.timeout_command.clone(),
        }
    }

    pub(crate) async fn lookup(&self, host: &str) -> Result<Option<String>, ResolveError> {
        let child = Command::new(&self.timeout_command)
            .arg(self.timeout.as_secs_f64().to_string())
            .arg(&self.dig_command)
            .arg("+short")
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ResolveError::Spawn)?;

        let output = tokio::time::timeout(self.timeout + GUARD_GRACE, child.wait_with_output())
            .await
            .map_err(|_| ResolveError::Timeout)?
            .map_err(ResolveError::Spawn)?;

        if output.status.code() == Some(TIMEOUT_EXIT_CODE) {
            return Err(ResolveError::Timeout);
        }
        if !output.status.success() {
            return Err(ResolveError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(msg = "lookup output", %stdout);
        Ok(parse_dig_output(&stdout))
    }
}

impl Resolve for DigResolver {
    #[instrument(skip(self), name = "resolve")]
    async fn resolve(&self, host: &str) -> Option<String> {
        match self.lookup(host).await {
            Ok(ip) => ip,
            Err(ResolveError::Timeout) => {
                warn!(msg = "timeout while resolving IP", timeout = ?self.timeout);
                None
            }
            Err(err) => {
                error!(kind = "ip resolution", %err);
                None
            }
        }
    }
}

/// Picks the first line containing exactly three dots.
///
/// CNAME answers are only skipped when their dot count differs from three.
pub(crate) fn parse_dig_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.matches('.').count() == 3)
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse_dig_output {
        use super::*;

        #[test]
        fn empty() {
            assert_eq!(parse_dig_output(""), None);
        }

        #[test]
        fn single_address() {
            assert_eq!(parse_dig_output("10.0.0.5\n"), Some("10.0.0.5".to_string()));
        }

        #[test]
        fn skips_cname_chain() {
            let output = "proxy.cluster-abc.eu-north-1.rds.amazonaws.com.\n\
                          ec2-13-48-1-2.eu-north-1.compute.amazonaws.com.\n\
                          13.48.1.2\n\
                          13.48.1.3\n";
            assert_eq!(parse_dig_output(output), Some("13.48.1.2".to_string()));
        }

        #[test]
        fn three_dot_cname_taken_as_address() {
            let output = "db.cname.example.\n10.0.0.5\n";
            assert_eq!(parse_dig_output(output), Some("db.cname.example.".to_string()));
        }

        #[test]
        fn no_dotted_quad() {
            assert_eq!(parse_dig_output(";; connection timed out\n"), None);
        }
    }

    mod lookup {
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use std::sync::OnceLock;

        use tempfile::TempDir;

        use super::*;

        static FAKE_DIGS: OnceLock<TempDir> = OnceLock::new();

        /// All scripts are written before any of them gets executed.
        fn fake_dig(name: &str) -> String {
            let dir = FAKE_DIGS.get_or_init(|| {
                let dir = TempDir::new().unwrap();
                let scripts = [
                    ("answer", "echo db.proxy.cname.example.\necho 10.0.0.5\n"),
                    ("cname_only", "echo db.proxy.cname.example.\n"),
                    ("slow", "exec sleep 5\n"),
                    ("broken", "echo 'no servers could be reached' >&2\nexit 9\n"),
                    ("args", "[ \"$1\" = +short ] && [ \"$2\" = db.example ] && echo 1.2.3.4\n"),
                ];
                for (name, body) in scripts {
                    let path = dir.path().join(name);
                    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                        .unwrap();
                }
                dir
            });
            let path: PathBuf = dir.path().join(name);
            path.to_string_lossy().into_owned()
        }

        fn resolver(dig_command: String) -> DigResolver {
            DigResolver {
                timeout: Duration::from_secs(1),
                dig_command,
                timeout_command: "timeout".to_string(),
            }
        }

        #[tokio::test]
        async fn first_address() {
            let result = resolver(fake_dig("answer")).lookup("db.example").await;
            assert_eq!(result.unwrap(), Some("10.0.0.5".to_string()));
        }

        #[tokio::test]
        async fn passes_short_flag_and_host() {
            let result = resolver(fake_dig("args")).lookup("db.example").await;
            assert_eq!(result.unwrap(), Some("1.2.3.4".to_string()));
        }

        #[tokio::test]
        async fn no_address() {
            let result = resolver(fake_dig("cname_only")).lookup("db.example").await;
            assert_eq!(result.unwrap(), None);
        }

        #[tokio::test]
        async fn timeout() {
            let result = resolver(fake_dig("slow")).lookup("db.example").await;
            assert!(matches!(result, Err(ResolveError::Timeout)));
        }

        #[tokio::test]
        async fn command_failure() {
            let result = resolver(fake_dig("broken")).lookup("db.example").await;
            match result {
                Err(ResolveError::Failed { status, stderr }) => {
                    assert_eq!(status.code(), Some(9));
                    assert_eq!(stderr, "no servers could be reached");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }

        #[tokio::test]
        async fn spawn_failure() {
            let mut resolver = resolver(fake_dig("answer"));
            resolver.timeout_command = "/nonexistent/timeout".to_string();
            let result = resolver.lookup("db.example").await;
            assert!(matches!(result, Err(ResolveError::Spawn(_))));
        }

        #[tokio::test]
        async fn resolve_swallows_errors() {
            assert_eq!(resolver(fake_dig("slow")).resolve("db.example").await, None);
            assert_eq!(
                resolver(fake_dig("broken")).resolve("db.example").await,
                None
            );
        }
    }
}
