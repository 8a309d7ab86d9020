use std::future::Future;
use std::time::Duration;

use devnet_core::DevnetError;
use tokio::time::Instant;
use tracing::debug;

use crate::options::Readiness;

/// Wait until `probe` reports ready, within `budget`.
///
/// With [`Readiness::FixedSettle`] the probe is never called and the whole
/// budget is slept. With [`Readiness::Probe`] the probe runs immediately and
/// then every `interval`; probe errors count as "not yet". Running out of
/// budget is [`DevnetError::NotReady`].
pub async fn wait_until_ready<F, Fut>(
    target: &str,
    strategy: Readiness,
    budget: Duration,
    mut probe: F,
) -> Result<(), DevnetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, DevnetError>>,
{
    let interval = match strategy {
        Readiness::FixedSettle => {
            debug!(daemon = %target, secs = budget.as_secs(), "settling");
            tokio::time::sleep(budget).await;
            return Ok(());
        }
        Readiness::Probe { interval } => interval,
    };

    let started = Instant::now();
    let deadline = started + budget;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match probe().await {
            Ok(true) => {
                debug!(daemon = %target, attempts, waited = ?started.elapsed(), "ready");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!(daemon = %target, error = %e, "readiness probe failed"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(DevnetError::NotReady {
                target: target.to_string(),
                waited: now - started,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
