use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

const TICK: Duration = Duration::from_secs(1);

/// Cooperative shutdown flag shared by the scan and tracker loops.
#[derive(Clone, Debug)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        RunFlag(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Sleeps in one-second ticks, returning early once stopped.
    /// A duration past the clock's range sleeps until stopped.
    pub async fn sleep(&self, duration: Duration) {
        let end = Instant::now().checked_add(duration);
        while self.is_running() {
            let now = Instant::now();
            let tick = match end {
                Some(end) if now >= end => break,
                Some(end) => TICK.min(end - now),
                None => TICK,
            };
            tokio::time::sleep(tick).await;
        }
    }
}

/// Awaits a background loop and reports how it ended. Returns `true` only
/// for a clean exit after the flag was stopped.
pub async fn watch_loop(name: &str, handle: JoinHandle<()>, running: RunFlag) -> bool {
    match handle.await {
        Ok(()) if !running.is_running() => {
            log::info!("{} loop stopped", name);
            true
        }
        Ok(()) => {
            log::error!("{} loop exited while the scanner is still running", name);
            false
        }
        Err(e) if e.is_panic() => {
            log::error!("{} loop panicked: {}", name, e);
            false
        }
        Err(e) => {
            log::error!("{} loop was cancelled: {}", name, e);
            false
        }
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}
