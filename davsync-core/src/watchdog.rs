use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Aborts a remote call once it has made no progress for `window`.
///
/// Every call to [`Watchdog::touch`] pushes the deadline forward, so a long
/// transfer that keeps moving bytes is never cut off.
#[derive(Debug, Clone)]
pub(crate) struct Watchdog {
    window: Duration,
    started: Instant,
    last_progress_ms: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stalled(pub Duration);

impl Watchdog {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            last_progress_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        self.last_progress_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self) -> Instant {
        let last = Duration::from_millis(self.last_progress_ms.load(Ordering::Relaxed));
        self.started + last + self.window
    }

    pub(crate) async fn guard<F, T>(&self, fut: F) -> Result<T, Stalled>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fut);
        loop {
            let deadline = self.deadline();
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = tokio::time::sleep_until(deadline) => {
                    if Instant::now() >= self.deadline() {
                        return Err(Stalled(self.window));
                    }
                }
            }
        }
    }
}
