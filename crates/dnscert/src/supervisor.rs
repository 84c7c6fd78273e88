use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// A service that stayed up this long failed for a new reason; its backoff starts over
const STABLE_UPTIME: Duration = Duration::from_secs(60);

/// How a failed service is brought back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// `None` restarts forever
    max_restarts: Option<u32>,
    first_delay: Duration,
    max_delay: Duration,
}

impl RestartPolicy {
    /// Restart forever, doubling the delay from `first_delay` up to `max_delay`
    pub const fn always(first_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_restarts: None,
            first_delay,
            max_delay,
        }
    }

    /// Like [`RestartPolicy::always`], but give up after `max_restarts` consecutive failures
    pub const fn limited(max_restarts: u32, first_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_restarts: Some(max_restarts),
            first_delay,
            max_delay,
        }
    }

    fn delay(&self, restart: u32) -> Duration {
        let factor = 1u32
            .checked_shl(restart.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn exhausted(&self, restarts: u32) -> bool {
        self.max_restarts.is_some_and(|max| restarts > max)
    }
}

/// Run a service in its own task and restart it under `policy` when it errors or panics.
/// The returned handle resolves once the service exits cleanly or the policy gives up.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let mut restarts: u32 = 0;

        loop {
            let started = Instant::now();
            let f = Arc::clone(&factory);

            match tokio::spawn(async move { f().await }).await {
                Ok(Ok(())) => {
                    info!(service = name, "Service exited");
                    return;
                }
                Ok(Err(e)) => error!(service = name, "Service failed: {e:#}"),
                Err(join_error) => error!(service = name, "Service task panicked: {join_error}"),
            }

            if started.elapsed() >= STABLE_UPTIME {
                restarts = 0;
            }
            restarts = restarts.saturating_add(1);

            if policy.exhausted(restarts) {
                error!(service = name, restarts, "Service keeps failing, giving up");
                return;
            }

            let delay = policy.delay(restarts);
            warn!(service = name, restart = restarts, "Restarting service in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    })
}
