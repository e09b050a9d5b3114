use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::errors::ChainResult;
use crate::node::NodeContext;

/// Cooperative daemon state: a single-instance latch claimed with an atomic
/// CAS at every tick, plus an adjustable sleep interval. A tick that loses
/// the latch simply waits for the next one.
pub struct Daemon {
    pub name: &'static str,
    latch: AtomicBool,
    sleep: Mutex<Duration>,
    pub ticks: AtomicU64,
}

impl Daemon {
    pub fn new(name: &'static str, sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            latch: AtomicBool::new(false),
            sleep: Mutex::new(sleep),
            ticks: AtomicU64::new(0),
        })
    }

    pub fn try_enter(&self) -> Option<LatchGuard<'_>> {
        if self
            .latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(LatchGuard(&self.latch))
        } else {
            None
        }
    }

    pub fn set_sleep(&self, duration: Duration) {
        *self.sleep.lock() = duration;
    }

    pub fn sleep_duration(&self) -> Duration {
        *self.sleep.lock()
    }
}

/// Scoped latch release.
pub struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one daemon until shutdown. Errors are logged and swallowed; panics
/// are recovered at the loop boundary so no iteration can take the process
/// down.
pub async fn run_daemon<F, Fut>(
    ctx: Arc<NodeContext>,
    daemon: Arc<Daemon>,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) where
    F: Fn(Arc<NodeContext>, Arc<Daemon>) -> Fut,
    Fut: Future<Output = ChainResult<()>>,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(daemon.sleep_duration()) => {
                let Some(_guard) = daemon.try_enter() else { continue };
                daemon.ticks.fetch_add(1, Ordering::Relaxed);
                let iteration = std::panic::AssertUnwindSafe(tick(ctx.clone(), daemon.clone()))
                    .catch_unwind();
                match iteration.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(daemon = daemon.name, ?err, "daemon iteration failed");
                    }
                    Err(_) => {
                        error!(daemon = daemon.name, "panic recovered in daemon loop");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_is_exclusive_and_scoped() {
        let daemon = Daemon::new("test", Duration::from_secs(1));
        let guard = daemon.try_enter().expect("first claim");
        assert!(daemon.try_enter().is_none());
        drop(guard);
        assert!(daemon.try_enter().is_some());
    }

    #[test]
    fn sleep_interval_is_adjustable() {
        let daemon = Daemon::new("test", Duration::from_secs(1));
        daemon.set_sleep(Duration::from_secs(4));
        assert_eq!(daemon.sleep_duration(), Duration::from_secs(4));
    }
}
