//! Outstanding-session counter shared between a lifecycle manager and the
//! session tasks it spawns.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new session. The count drops again when the guard is dropped,
    /// whichever way the session task exits.
    pub fn enter(&self) -> SessionGuard {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        SessionGuard {
            tracker: self.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Resolve once no session is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct SessionGuard {
    tracker: SessionTracker,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let inner = &self.tracker.inner;
        if inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.idle.notify_waiters();
        }
    }
}
