//! Polling driver

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::PropagationError;

/// Calls `f` every `interval` until it returns `Ok(true)`.
///
/// `Ok(false)` and errors both count as "not yet"; the most recent error is
/// kept and reported once no further attempt fits before `timeout`. The
/// deadline also bounds an attempt that is still running, so a hanging
/// check cannot outlive it.
pub async fn wait_for<F, Fut>(
    cancel: &CancellationToken,
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> Result<(), PropagationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, PropagationError>>,
{
    info!(timeout = ?timeout, interval = ?interval, "Wait for {}", what);

    let deadline = Instant::now() + timeout;
    let mut last_error: Option<PropagationError> = None;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PropagationError::Cancelled),
            outcome = tokio::time::timeout_at(deadline, f()) => outcome,
        };

        match outcome {
            Ok(Ok(true)) => {
                debug!(attempt, "{} succeeded", what);
                return Ok(());
            }
            Ok(Ok(false)) => {
                debug!(attempt, "{} not ready yet", what);
            }
            Ok(Err(err)) if err.is_cancelled() => return Err(err),
            Ok(Err(err)) => {
                debug!(attempt, error = %err, "{} not ready yet", what);
                last_error = Some(err);
            }
            Err(_) => break,
        }

        // the next attempt would start past the deadline
        if Instant::now() + interval > deadline {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PropagationError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }

    Err(PropagationError::TimeLimitExceeded {
        last_error: last_error.map(Box::new),
    })
}
