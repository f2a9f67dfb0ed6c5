//! Bootstrap utilities for the provisioner binary and its handlers.

use std::future::Future;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::utils::retry::readiness_backoff;

/// Initialize tracing with the PROVISIONER_LOG environment variable.
///
/// Defaults to "info" level if PROVISIONER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Error returned when a dependency never became ready.
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("{name} not ready after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("{name} not ready: {cause}")]
    Failed { name: String, cause: String },
}

/// Retry `attempt` with exponential backoff until it succeeds or `timeout` elapses.
///
/// # Arguments
/// * `name` - Human-readable name for logging (e.g., "postgres", "runner endpoint")
/// * `timeout` - Overall deadline for all attempts
/// * `attempt` - Async function that probes the dependency
pub async fn wait_until_ready<T, E, F, Fut>(
    name: &str,
    timeout: Duration,
    attempt: F,
) -> Result<T, ReadinessError>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let retried = attempt
        .retry(readiness_backoff())
        .notify(|err: &E, dur: Duration| {
            warn!(dependency = %name, error = %err, delay = ?dur, "Not ready, retrying");
        });

    match tokio::time::timeout(timeout, retried).await {
        Ok(Ok(value)) => {
            info!(dependency = %name, "Dependency ready");
            Ok(value)
        }
        Ok(Err(err)) => Err(ReadinessError::Failed {
            name: name.to_string(),
            cause: err.to_string(),
        }),
        Err(_) => Err(ReadinessError::Timeout {
            name: name.to_string(),
            timeout,
        }),
    }
}

/// Wait for a TCP listener to accept connections at `address` (host:port).
pub async fn wait_for_tcp(
    address: &str,
    timeout: Duration,
) -> Result<(), ReadinessError> {
    wait_until_ready(address, timeout, move || async move {
        tokio::net::TcpStream::connect(address).await.map(|_| ())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_wait_until_ready_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, ReadinessError> =
            wait_until_ready("flaky", Duration::from_secs(10), move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_times_out() {
        let result: Result<(), ReadinessError> =
            wait_until_ready("never", Duration::from_secs(1), || async {
                Err("down".to_string())
            })
            .await;

        assert!(matches!(result, Err(ReadinessError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_tcp_succeeds_on_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        wait_for_tcp(&addr, Duration::from_secs(5)).await.unwrap();
    }
}
