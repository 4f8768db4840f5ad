//! Session-scoped shared state.
//!
//! The recording flag and the active-timer registry are the only pieces of
//! explicitly shared, mutually-mutated state in the engine. Instead of
//! ambient globals they live in one [`SessionContext`] owned by the
//! lifecycle controller and passed to every component that needs them.
//!
//! The recording flag is read-mostly (toggled only by lifecycle
//! operations), the timer registry is append/drain-only, so an atomic and
//! one coarse lock cover both.

use crate::publish::ConnectionGauge;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct SessionContext {
    recording: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    pub gauge: Arc<ConnectionGauge>,
}

impl SessionContext {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            recording: AtomicBool::new(false),
            timers: Mutex::new(Vec::new()),
            shutdown_tx,
            gauge: Arc::new(ConnectionGauge::new()),
        }
    }

    /// Session-wide gate controlling whether polled measurements and GPS
    /// fixes are persisted.
    pub fn recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn set_recording(&self, enabled: bool) {
        self.recording.store(enabled, Ordering::SeqCst);
    }

    /// Every spawned task whose loop must die on `stop()` registers here.
    pub fn register_timer(&self, handle: JoinHandle<()>) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.push(handle);
        }
    }

    /// Count of registered tasks that have not finished.
    pub fn active_timers(&self) -> usize {
        match self.timers.lock() {
            Ok(timers) => timers.iter().filter(|t| !t.is_finished()).count(),
            Err(_) => 0,
        }
    }

    /// Receiver every task selects on; flips to `true` exactly once.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Cancel every outstanding timer. The cooperative signal goes first so
    /// loops can close their ports; whatever remains is aborted. Returns
    /// the number of drained handles.
    pub fn cancel_all(&self) -> usize {
        let _ = self.shutdown_tx.send(true);
        let drained = match self.timers.lock() {
            Ok(mut timers) => std::mem::take(&mut *timers),
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for handle in drained {
            handle.abort();
        }
        debug!(count, "cancelled session timers");
        count
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_all_drains_every_timer() {
        let ctx = SessionContext::new();
        for _ in 0..3 {
            let mut shutdown = ctx.shutdown_signal();
            ctx.register_timer(tokio::spawn(async move {
                let _ = shutdown.changed().await;
            }));
        }
        assert_eq!(ctx.active_timers(), 3);

        let drained = ctx.cancel_all();
        assert_eq!(drained, 3);
        assert_eq!(ctx.active_timers(), 0);
    }

    #[tokio::test]
    async fn recording_flag_round_trips() {
        let ctx = SessionContext::new();
        assert!(!ctx.recording());
        ctx.set_recording(true);
        assert!(ctx.recording());
        ctx.set_recording(false);
        assert!(!ctx.recording());
    }

    #[tokio::test]
    async fn shutdown_signal_reaches_subscribers() {
        let ctx = SessionContext::new();
        let mut rx = ctx.shutdown_signal();
        ctx.cancel_all();
        tokio::time::timeout(Duration::from_millis(100), rx.changed())
            .await
            .expect("signal in time")
            .expect("channel open");
        assert!(*rx.borrow());
    }
}
