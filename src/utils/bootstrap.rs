//! Bootstrap utilities for the fault-bridge binary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::diagnostics::{DiagnosticsData, RecentLogLayer};

/// Initialize tracing with the FAULT_BRIDGE_LOG environment variable.
///
/// Defaults to "info" level if FAULT_BRIDGE_LOG is not set. WARN and ERROR
/// events are also copied into `diagnostics` for the heartbeat.
pub fn init_tracing(diagnostics: Arc<DiagnosticsData>) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(RecentLogLayer::new(diagnostics))
        .init();
}

/// Run a broker connection attempt with capped exponential backoff.
///
/// Returns the last error once `max_attempts` attempts have failed.
pub async fn connect_with_retry<T, E, F, Fut>(
    broker: &str,
    address: &str,
    max_attempts: u32,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    const INITIAL_DELAY: Duration = Duration::from_millis(100);
    const MAX_DELAY: Duration = Duration::from_secs(5);

    let mut delay = INITIAL_DELAY;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connection) => {
                tracing::info!(broker, address, attempt, "Connected to broker");
                return Ok(connection);
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    broker,
                    address,
                    attempt,
                    max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Broker connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_DELAY);
            }
            Err(e) => {
                tracing::error!(broker, address, attempts = attempt, error = %e, "Giving up connecting to broker");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_eventually_succeeds() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_retry("amqp", "localhost", 5, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("refused {}", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_gives_up() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), String> = connect_with_retry("amqp", "localhost", 4, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("refused".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
