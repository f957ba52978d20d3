use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default bound for waits that have no configured value
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `future` with a deadline, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
