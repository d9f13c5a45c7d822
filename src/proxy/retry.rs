use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, warn};


/// Runs `f` until it succeeds, waiting `interval` after every failure.
///
/// Returns `true` if `f` eventually succeeded, and `false` if the loop was cancelled first (or the
///  cancellation channel was closed).
pub async fn retry_until_success<F, Fut>(description: &str, interval: Duration, mut cancel: broadcast::Receiver<()>, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        select! {
            result = f() => {
                match result {
                    Ok(()) => return true,
                    Err(e) => warn!("{} failed, retrying in {:?}: {}", description, interval, e),
                }
            }
            _ = cancel.recv() => {
                debug!("{} cancelled", description);
                return false;
            }
        }

        select! {
            _ = sleep(interval) => {}
            _ = cancel.recv() => {
                debug!("{} cancelled", description);
                return false;
            }
        }
    }
}
