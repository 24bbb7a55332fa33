//! Async timeout helpers shared by the client and server.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Default bound for establishing an outbound connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for tearing down a single connection during server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for one frame write; a peer that stops reading past this is dropped
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, mapping expiry to [`TransportError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}
