//! Expiry scheduler for ephemeral uploads.
//!
//! Holds every known `(location, expires_at)` pair in a min-heap and runs a
//! single background task that sleeps until the soonest deadline, then
//! reclaims everything that has come due.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// How long the loop waits before re-checking an empty queue.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// Error returned when a file cannot be enrolled.
///
/// Enrollment failures are not fatal to an upload: the file is stored but
/// will not expire on its own.
#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("Expiry scheduler has been stopped")]
    Stopped,

    #[error("Expiry queue lock poisoned")]
    Poisoned,
}

/// Error reported by a [`Reclaimer`]. Only ever logged.
pub type ReclaimError = Box<dyn std::error::Error + Send + Sync>;

/// Deletes an expired file.
///
/// Gets the whole entry so it can tell whether the location still holds the
/// file that was scheduled, or one uploaded after it.
#[async_trait]
pub trait Reclaimer: Send + Sync + 'static {
    async fn reclaim(&self, entry: &PendingExpiry) -> Result<(), ReclaimError>;
}

/// A scheduled deletion. In-memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExpiry {
    pub location: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl Ord for PendingExpiry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the earliest deadline first
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.location.cmp(&self.location))
    }
}

impl PartialOrd for PendingExpiry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<PendingExpiry>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Notify,
    reclaimer: Arc<dyn Reclaimer>,
    idle_interval: Duration,
}

impl Shared {
    /// Pop every entry due at `now`, in deadline order.
    fn take_due(&self, now: i64) -> Vec<PendingExpiry> {
        let Ok(mut queue) = self.queue.lock() else {
            return Vec::new();
        };

        let mut due = Vec::new();
        while queue.heap.peek().is_some_and(|next| next.expires_at <= now) {
            if let Some(entry) = queue.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Time until the soonest deadline, or the idle interval if there is none.
    fn next_wait(&self) -> Duration {
        let next = self
            .queue
            .lock()
            .ok()
            .and_then(|queue| queue.heap.peek().map(|entry| entry.expires_at));

        match next {
            None => self.idle_interval,
            Some(expires_at) => {
                let until = expires_at.saturating_sub(Timestamp::now().as_second());
                Duration::from_secs(until.max(0) as u64)
            }
        }
    }

    async fn reclaim_due(&self) {
        let due = self.take_due(Timestamp::now().as_second());
        if due.is_empty() {
            return;
        }

        debug!(count = due.len(), "Reclaiming expired files");
        for entry in due {
            match self.reclaimer.reclaim(&entry).await {
                Ok(()) => info!(
                    location = %entry.location,
                    expires_at = entry.expires_at,
                    "Reclaimed expired file"
                ),
                Err(err) => error!(
                    location = %entry.location,
                    error = %err,
                    "Failed to delete expired file"
                ),
            }
        }
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns the expiry queue and its background reclamation task.
pub struct ExpiryScheduler {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ExpiryScheduler {
    pub fn new(reclaimer: Arc<dyn Reclaimer>) -> Self {
        Self::with_idle_interval(reclaimer, DEFAULT_IDLE_INTERVAL)
    }

    pub fn with_idle_interval(reclaimer: Arc<dyn Reclaimer>, idle_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                wake: Notify::new(),
                reclaimer,
                idle_interval,
            }),
            running: Mutex::new(None),
        }
    }

    /// Register a file for deletion at `expires_at` (Unix seconds).
    ///
    /// Callers filter out files that never expire. Entries already past due
    /// are reclaimed on the next pass of the loop.
    pub fn enroll(&self, location: impl Into<String>, expires_at: i64) -> Result<(), EnrollError> {
        let location = location.into();
        let soonest = {
            let mut queue = self.shared.queue.lock().map_err(|_| EnrollError::Poisoned)?;
            if queue.stopped {
                return Err(EnrollError::Stopped);
            }

            let soonest = queue
                .heap
                .peek()
                .is_none_or(|next| expires_at < next.expires_at);
            queue.heap.push(PendingExpiry {
                location,
                expires_at,
            });
            soonest
        };

        if soonest {
            // Stores a permit if the loop is not currently waiting
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Number of entries waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .map(|queue| queue.heap.len())
            .unwrap_or(0)
    }

    /// Spawn the background task. Calling this again while running does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let join = tokio::spawn(async move { reclaim_loop(shared, shutdown_rx).await });

        info!(idle_interval = ?self.shared.idle_interval, "Started expiry scheduler");
        *running = Some(Running { shutdown_tx, join });
    }

    /// Stop the background task and wait for it to exit.
    ///
    /// Entries still queued are never reclaimed; later calls to [`enroll`](Self::enroll) fail.
    pub async fn stop(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.stopped = true;
        }

        let running = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(Running { shutdown_tx, join }) = running {
            // ignore send error: the loop may already be gone
            let _ = shutdown_tx.send(true);
            if let Err(err) = join.await {
                error!(error = %err, "Expiry scheduler task failed");
            }
            info!("Stopped expiry scheduler");
        }
    }
}

async fn reclaim_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        shared.reclaim_due().await;

        let wait = shared.next_wait();
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped without an explicit stop
                if changed.is_err() {
                    break;
                }
            }
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
