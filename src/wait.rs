//! Bounded fixed-interval reachability waiting.
//!
//! Cloud-init boot times are short, so the wait uses a fixed interval rather
//! than exponential backoff: a bounded number of TCP connection attempts with
//! a constant sleep between failures.

use anyhow::{Context, Result};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Configuration for a bounded fixed-interval wait
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Per-attempt timeout, also the sleep between failed attempts
    pub interval: Duration,
    /// Maximum number of attempts before surfacing the last error
    pub max_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Run `check` up to `config.max_attempts` times, sleeping `config.interval`
/// between failures.
///
/// Returns on the first success regardless of remaining attempt budget. After
/// the last failed attempt the underlying error is surfaced as the error
/// source, so callers can still see the original `io::ErrorKind`.
pub async fn wait_until<F, Fut>(config: &WaitConfig, check: F, target: &str) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let mut last_err = None;

    for attempt in 1..=config.max_attempts {
        match check().await {
            Ok(()) => {
                debug!(target = %target, attempt, "Target reachable");
                return Ok(());
            }
            Err(e) => {
                debug!(
                    target = %target,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "Connection attempt failed"
                );
                last_err = Some(e);
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.interval).await;
                }
            }
        }
    }

    // max_attempts >= 1, so the loop ran at least once and set last_err
    Err(last_err.unwrap_or_else(|| io::Error::other("no connection attempts made"))).with_context(
        || {
            format!(
                "{} not reachable after {} attempts",
                target, config.max_attempts
            )
        },
    )
}

/// Wait for TCP-level connectivity to `addr:port`, used as a proxy for "sshd
/// is ready".
pub async fn wait_for_connection(
    addr: &str,
    port: u16,
    timeout: Duration,
    max_attempts: u32,
) -> Result<()> {
    let target = format!("{addr}:{port}");
    let config = WaitConfig {
        interval: timeout,
        max_attempts,
    };

    wait_until(
        &config,
        || async {
            match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {target} timed out"),
                )),
            }
        },
        &target,
    )
    .await
}
