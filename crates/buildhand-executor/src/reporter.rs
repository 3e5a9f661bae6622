//! State reporter.
//!
//! Every record mutation funnels through one [`Reporter`] per build. The
//! record handle's mutex is held across the upload, so updates to the same
//! record are totally ordered; different records upload concurrently.
//! Uploads retry with bounded exponential backoff; exhaustion surfaces as
//! an API error the caller decides the fate of.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use buildhand_client::{ClientError, ControlPlane};
use buildhand_core::BuildRecord;

use crate::{ExecutorResult, LogHandle, ServiceHandle, StepHandle};

/// Upload attempts before giving up.
const ATTEMPTS: u32 = 5;
/// First retry delay.
const INITIAL_DELAY: Duration = Duration::from_millis(500);
/// Retry delay ceiling.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Serialized uploader for one build's records.
#[derive(Clone)]
pub struct Reporter {
    api: Arc<dyn ControlPlane>,
}

impl Reporter {
    /// Creates a reporter over a control-plane client.
    pub fn new(api: Arc<dyn ControlPlane>) -> Self {
        Self { api }
    }

    /// The underlying control-plane client.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn ControlPlane> {
        &self.api
    }

    /// Uploads the build record held by `handle`.
    pub async fn upload_build(&self, handle: &Arc<tokio::sync::Mutex<BuildRecord>>) -> ExecutorResult {
        let mut record = handle.lock().await;
        let persisted = {
            let api = &self.api;
            let snapshot: &BuildRecord = &record;
            retry("build update", ClientError::is_retriable, move || {
                api.update_build(snapshot)
            })
            .await?
        };
        *record = persisted;
        Ok(())
    }

    /// Uploads the step record held by `handle`.
    pub async fn upload_step(&self, handle: &StepHandle) -> ExecutorResult {
        let mut record = handle.lock().await;
        let persisted = {
            let api = &self.api;
            let snapshot = &*record;
            retry("step update", ClientError::is_retriable, move || {
                api.update_step(snapshot)
            })
            .await?
        };
        *record = persisted;
        Ok(())
    }

    /// Uploads the service record held by `handle`.
    pub async fn upload_service(&self, handle: &ServiceHandle) -> ExecutorResult {
        let mut record = handle.lock().await;
        let persisted = {
            let api = &self.api;
            let snapshot = &*record;
            retry("service update", ClientError::is_retriable, move || {
                api.update_service(snapshot)
            })
            .await?
        };
        *record = persisted;
        Ok(())
    }

    /// Uploads the log record held by `handle` against the step log
    /// resource.
    pub async fn upload_step_log(&self, handle: &LogHandle) -> ExecutorResult {
        let mut record = handle.lock().await;
        let persisted = {
            let api = &self.api;
            let snapshot = &*record;
            retry("step log update", ClientError::is_retriable, move || {
                api.update_step_log(snapshot)
            })
            .await?
        };
        *record = persisted;
        Ok(())
    }

    /// Uploads the log record held by `handle` against the service log
    /// resource.
    pub async fn upload_service_log(&self, handle: &LogHandle) -> ExecutorResult {
        let mut record = handle.lock().await;
        let persisted = {
            let api = &self.api;
            let snapshot = &*record;
            retry("service log update", ClientError::is_retriable, move || {
                api.update_service_log(snapshot)
            })
            .await?
        };
        *record = persisted;
        Ok(())
    }
}

/// Retries `operation` with bounded exponential backoff while
/// `is_retriable` holds for the error.
pub(crate) async fn retry<T, E, P, F, Fut>(
    what: &str,
    is_retriable: P,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = INITIAL_DELAY;

    for attempt in 1..=ATTEMPTS {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < ATTEMPTS && is_retriable(&e) => {
                warn!(%e, attempt, "{what} failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop returns on the last attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ClientError> = retry("op", ClientError::is_retriable, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::api(503, "busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ClientError> = retry("op", ClientError::is_retriable, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::api(500, "down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ClientError> = retry("op", ClientError::is_retriable, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::api(400, "bad payload")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
