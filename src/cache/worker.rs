//! The process-wide background refresh worker
//!
//! A single detached task drains a queue of refresh jobs submitted by
//! [`NonBlockingPrefetchStrategy`][super::NonBlockingPrefetchStrategy]
//! instances. The worker is shared by every supplier in the process and is
//! spawned lazily on first use; tests can tear it down with [`shutdown`]
//! and a subsequent dispatch will spawn a fresh one.

use std::{
    future::Future,
    pin::Pin,
    sync::{Mutex, OnceLock, PoisonError},
};

use tokio::sync::mpsc;

/// A queued background refresh job
pub(crate) type BackgroundJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

static SENDER: OnceLock<Mutex<Option<mpsc::UnboundedSender<BackgroundJob>>>> = OnceLock::new();

fn sender_slot() -> &'static Mutex<Option<mpsc::UnboundedSender<BackgroundJob>>> {
    SENDER.get_or_init(|| Mutex::new(None))
}

fn spawn_worker() -> mpsc::UnboundedSender<BackgroundJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BackgroundJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job.await;
        }
        tracing::debug!("background refresh worker stopped");
    });
    tx
}

/// Starts the background refresh worker if it is not already running
///
/// Must be called from within a tokio runtime. Dispatching a job also
/// starts the worker on demand, so calling this is only necessary when the
/// worker should be up before the first prefetch.
pub fn initialize() {
    let mut slot = sender_slot().lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(spawn_worker());
    }
}

/// Stops the background refresh worker
///
/// Jobs already queued are drained before the worker task exits. A later
/// dispatch spawns a fresh worker.
pub fn shutdown() {
    sender_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}

/// Serializes tests that exercise the shared worker, so a job queued by one
/// test is never dropped by another test's runtime shutting down. Callers
/// should pair this with [`shutdown`] to respawn the worker on their own
/// runtime.
#[cfg(test)]
pub(crate) fn serial_test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queues a job for the background worker, starting the worker if needed
///
/// Returns the job to the caller if it could not be queued.
pub(crate) fn dispatch(job: BackgroundJob) -> Result<(), BackgroundJob> {
    let mut slot = sender_slot().lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().map_or(true, mpsc::UnboundedSender::is_closed) {
        *slot = Some(spawn_worker());
    }
    match slot.as_ref() {
        Some(tx) => tx.send(job).map_err(|rejected| rejected.0),
        None => Err(job),
    }
}
