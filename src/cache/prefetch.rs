//! Prefetch strategies
//!
//! A strategy decides what happens when a read lands inside the prefetch
//! window. It must be safe to invoke concurrently and must never make the
//! reading caller wait longer than necessary; refresh failures on this path
//! are logged and swallowed because the current value is still fresh.

use std::{
    error,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::worker;
use crate::Error;

/// A boxed refresh operation handed to a prefetch strategy
pub type RefreshFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'static>>;

/// The maximum number of background refreshes in flight across the process
const MAX_CONCURRENT_REFRESHES: usize = 100;

fn concurrent_refresh_lease() -> &'static Semaphore {
    static LEASE: OnceLock<Semaphore> = OnceLock::new();
    LEASE.get_or_init(|| Semaphore::new(MAX_CONCURRENT_REFRESHES))
}

/// A policy governing reads that land inside the prefetch window
#[async_trait]
pub trait PrefetchStrategy: Send + Sync + fmt::Debug {
    /// Runs or schedules `refresh` in response to a prefetch-eligible read
    async fn prefetch(&self, refresh: RefreshFuture);
}

/// Clears a shared flag when dropped, so a strategy's gate reopens even if
/// the guarded refresh is abandoned.
struct OpenGateOnDrop(Arc<AtomicBool>);

impl Drop for OpenGateOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn try_close_gate(gate: &Arc<AtomicBool>) -> Option<OpenGateOnDrop> {
    gate.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .ok()
        .map(|_| OpenGateOnDrop(Arc::clone(gate)))
}

/// At most one caller runs the refresh; everyone else returns immediately
///
/// The caller that wins the gate performs the refresh on its own stack and
/// so pays its latency. Concurrent callers see the gate closed and return
/// the still-fresh cached value without waiting.
#[derive(Debug, Default)]
pub struct OneCallerBlocksPrefetchStrategy {
    currently_refreshing: Arc<AtomicBool>,
}

impl OneCallerBlocksPrefetchStrategy {
    /// Constructs a new strategy with an open gate
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrefetchStrategy for OneCallerBlocksPrefetchStrategy {
    async fn prefetch(&self, refresh: RefreshFuture) {
        let Some(_gate) = try_close_gate(&self.currently_refreshing) else {
            return;
        };
        if let Err(err) = refresh.await {
            tracing::warn!(
                error = &err as &dyn error::Error,
                "prefetch refresh failed; retaining current value"
            );
        }
    }
}

/// The caller never waits: refreshes run on the shared background worker
///
/// Submissions are bounded by a process-wide lease of
/// [`MAX_CONCURRENT_REFRESHES`] outstanding refreshes, and a supplier with a
/// refresh already queued or running has duplicate submissions rejected.
#[derive(Debug, Default)]
pub struct NonBlockingPrefetchStrategy {
    currently_prefetching: Arc<AtomicBool>,
}

impl NonBlockingPrefetchStrategy {
    /// Constructs a new strategy with no refresh in flight
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrefetchStrategy for NonBlockingPrefetchStrategy {
    async fn prefetch(&self, refresh: RefreshFuture) {
        let Ok(permit) = concurrent_refresh_lease().try_acquire() else {
            tracing::warn!(
                limit = MAX_CONCURRENT_REFRESHES,
                "background refresh lease exhausted; skipping prefetch"
            );
            return;
        };

        let Some(gate) = try_close_gate(&self.currently_prefetching) else {
            return;
        };

        let queued = worker::dispatch(Box::pin(async move {
            let _permit = permit;
            let _gate = gate;
            if let Err(err) = refresh.await {
                tracing::warn!(
                    error = &err as &dyn error::Error,
                    "background refresh failed; retaining current value"
                );
            }
        }));

        if queued.is_err() {
            tracing::warn!("background refresh worker unavailable; skipping prefetch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_refresh(counter: &Arc<AtomicUsize>) -> RefreshFuture {
        let counter = Arc::clone(counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn one_caller_blocks_runs_refresh_inline() {
        let strategy = OneCallerBlocksPrefetchStrategy::new();
        let counter = Arc::new(AtomicUsize::new(0));

        strategy.prefetch(counting_refresh(&counter)).await;
        strategy.prefetch(counting_refresh(&counter)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_caller_blocks_rejects_while_gate_is_held() {
        let strategy = Arc::new(OneCallerBlocksPrefetchStrategy::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let holder = {
            let strategy = Arc::clone(&strategy);
            let counter = Arc::clone(&counter);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                strategy
                    .prefetch(Box::pin(async move {
                        release.notified().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }))
                    .await;
            })
        };

        tokio::task::yield_now().await;
        strategy.prefetch(counting_refresh(&counter)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        release.notify_one();
        holder.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_blocking_defers_to_the_worker_and_rejects_duplicates() {
        let _serial = worker::serial_test_lock();
        worker::shutdown();

        let strategy = NonBlockingPrefetchStrategy::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        {
            let counter = Arc::clone(&counter);
            let release = Arc::clone(&release);
            strategy
                .prefetch(Box::pin(async move {
                    release.notified().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .await;
        }

        // a second submission while the first is still queued is rejected
        strategy.prefetch(counting_refresh(&counter)).await;

        release.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // with the first refresh complete, the gate reopens
        strategy.prefetch(counting_refresh(&counter)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
