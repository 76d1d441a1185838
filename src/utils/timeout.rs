//! Async timeout wrappers and the default durations used across the client.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{ProtocolError, Result};

/// Budget for connecting and for each negotiation or handshake step.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the client sends a heartbeat once the session is up.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for the writer task to drain on close.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `fut`, turning an elapsed deadline into [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, dur: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(dur, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = dur.as_millis() as u64, "Operation timed out");
            Err(ProtocolError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_is_timeout() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn inner_result_passes_through() {
        let ok = with_timeout_error(async { Ok(7) }, DEFAULT_TIMEOUT).await;
        assert_eq!(ok.ok(), Some(7));
        let err: Result<()> =
            with_timeout_error(async { Err(ProtocolError::ConnectionClosed) }, DEFAULT_TIMEOUT).await;
        assert!(matches!(err, Err(ProtocolError::ConnectionClosed)));
    }
}
