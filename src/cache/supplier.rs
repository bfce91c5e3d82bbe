use std::{
    error, fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, PoisonError, RwLock, Weak},
    time::Duration,
};

use aliri_clock::{Clock, System, UnixTime};

use super::{
    prefetch::{OneCallerBlocksPrefetchStrategy, PrefetchStrategy, RefreshFuture},
    RefreshResult, StaleValueBehavior,
};
use crate::{
    jitter::{JitterSource, RandomLateJitter},
    Error,
};

/// How long a caller on the stale path waits for the refresh lock before
/// giving up
const BLOCKING_REFRESH_MAX_WAIT: Duration = Duration::from_secs(5);

type BoxedRefresh<T> =
    Pin<Box<dyn Future<Output = Result<RefreshResult<T>, Error>> + Send + 'static>>;
type RefreshFn<T> = Box<dyn Fn() -> BoxedRefresh<T> + Send + Sync + 'static>;

/// Why a refresh is being attempted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefreshDisposition {
    /// The entry is stale; the caller waits for the result
    Blocking,
    /// The entry is still fresh; the refresh is opportunistic
    Prefetch,
}

struct SupplierState<T, C> {
    refresh_fn: RefreshFn<T>,
    cached: RwLock<Option<Arc<RefreshResult<T>>>>,
    refresh_lock: tokio::sync::Mutex<()>,
    prefetch_strategy: Box<dyn PrefetchStrategy>,
    stale_value_behavior: StaleValueBehavior,
    jitter: Box<dyn JitterSource>,
    clock: C,
}

impl<T, C> SupplierState<T, C> {
    fn load(&self) -> Option<Arc<RefreshResult<T>>> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, result: RefreshResult<T>) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(result));
    }
}

impl<T, C> SupplierState<T, C>
where
    T: Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    fn needs_refresh(&self, disposition: RefreshDisposition, now: UnixTime) -> bool {
        match (self.load(), disposition) {
            (None, _) => true,
            (Some(entry), RefreshDisposition::Blocking) => entry.is_stale_at(now),
            (Some(entry), RefreshDisposition::Prefetch) => entry.should_prefetch_at(now),
        }
    }

    async fn refresh(&self, disposition: RefreshDisposition) -> Result<(), Error> {
        let _guard = match disposition {
            RefreshDisposition::Blocking => {
                match tokio::time::timeout(BLOCKING_REFRESH_MAX_WAIT, self.refresh_lock.lock())
                    .await
                {
                    Ok(guard) => guard,
                    Err(_) => return self.handle_lock_timeout(),
                }
            }
            RefreshDisposition::Prefetch => match self.refresh_lock.try_lock() {
                Ok(guard) => guard,
                // someone else is already refreshing; the value is still fresh
                Err(_) => return Ok(()),
            },
        };

        if !self.needs_refresh(disposition, self.clock.now()) {
            return Ok(());
        }

        match (self.refresh_fn)().await {
            Ok(mut refreshed) => {
                refreshed.apply_jitter(self.jitter.as_ref());
                tracing::debug!(
                    stale_time = refreshed.stale_time().map(|t| t.0),
                    prefetch_time = refreshed.prefetch_time().map(|t| t.0),
                    "stored refreshed value"
                );
                self.store(refreshed);
                Ok(())
            }
            Err(err) => self.handle_refresh_failure(err, disposition),
        }
    }

    fn handle_lock_timeout(&self) -> Result<(), Error> {
        if self.stale_value_behavior == StaleValueBehavior::Allow && self.load().is_some() {
            tracing::warn!("timed out waiting for the refresh lock; returning the previous value");
            Ok(())
        } else {
            Err(Error::ConcurrentOperation)
        }
    }

    fn handle_refresh_failure(
        &self,
        err: Error,
        disposition: RefreshDisposition,
    ) -> Result<(), Error> {
        match disposition {
            // the prefetch strategy logs and swallows; the value is still fresh
            RefreshDisposition::Prefetch => Err(err),
            RefreshDisposition::Blocking => {
                if self.stale_value_behavior == StaleValueBehavior::Strict
                    || self.load().is_none()
                {
                    Err(Error::Cache {
                        source: Box::new(err),
                    })
                } else {
                    tracing::warn!(
                        error = &err as &dyn error::Error,
                        "failed to refresh the cached value; using the previous value"
                    );
                    Ok(())
                }
            }
        }
    }
}

/// A generic, time-triggered cache holding a single refreshed value
///
/// The supplier coordinates concurrent callers around one entry: fresh
/// reads return immediately, prefetch-eligible reads trigger the configured
/// strategy while still returning the current value, and stale reads block
/// on a single-flight refresh bounded by a five second wait for the refresh
/// lock. Successful refreshes are jittered before being stored.
///
/// Cloning the supplier produces another handle to the same cache.
pub struct CachedResultSupplier<T, C = System> {
    state: Arc<SupplierState<T, C>>,
}

impl<T, C> Clone for CachedResultSupplier<T, C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, C: fmt::Debug> fmt::Debug for CachedResultSupplier<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CachedResultSupplier")
            .field("prefetch_strategy", &self.state.prefetch_strategy)
            .field("stale_value_behavior", &self.state.stale_value_behavior)
            .field("jitter", &self.state.jitter)
            .field("clock", &self.state.clock)
            .finish_non_exhaustive()
    }
}

impl<T> CachedResultSupplier<T, System>
where
    T: Send + Sync + 'static,
{
    /// Starts building a supplier around the given refresh function
    pub fn builder<F, Fut>(refresh_fn: F) -> CachedResultSupplierBuilder<T, System>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RefreshResult<T>, Error>> + Send + 'static,
    {
        CachedResultSupplierBuilder {
            refresh_fn: Box::new(move || Box::pin(refresh_fn())),
            prefetch_strategy: Box::new(OneCallerBlocksPrefetchStrategy::new()),
            stale_value_behavior: StaleValueBehavior::default(),
            jitter: Box::new(RandomLateJitter::default()),
            clock: System,
        }
    }
}

impl<T, C> CachedResultSupplier<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Gets the cached value, refreshing it if required
    ///
    /// Blocks only when the entry is stale (or absent); reads inside the
    /// prefetch window return the current value and leave renewal to the
    /// prefetch strategy.
    pub async fn get(&self) -> Result<T, Error> {
        let now = self.state.clock.now();
        let mut entry = self.state.load();

        if entry.as_deref().map_or(true, |e| e.is_stale_at(now)) {
            self.state.refresh(RefreshDisposition::Blocking).await?;
            entry = self.state.load();
        }

        let Some(entry) = entry else {
            return Err(Error::ConcurrentOperation);
        };

        if entry.should_prefetch_at(now) {
            let weak = Arc::downgrade(&self.state);
            let refresh: RefreshFuture = Box::pin(async move {
                match Weak::upgrade(&weak) {
                    Some(state) => state.refresh(RefreshDisposition::Prefetch).await,
                    None => Ok(()),
                }
            });
            self.state.prefetch_strategy.prefetch(refresh).await;
        }

        Ok(entry.value().clone())
    }

    /// A snapshot of the current entry, if one is held
    ///
    /// Intended for inspection and diagnostics; does not trigger a refresh.
    pub fn peek(&self) -> Option<Arc<RefreshResult<T>>> {
        self.state.load()
    }
}

/// Builder for [`CachedResultSupplier`]
pub struct CachedResultSupplierBuilder<T, C = System> {
    refresh_fn: RefreshFn<T>,
    prefetch_strategy: Box<dyn PrefetchStrategy>,
    stale_value_behavior: StaleValueBehavior,
    jitter: Box<dyn JitterSource>,
    clock: C,
}

impl<T, C: fmt::Debug> fmt::Debug for CachedResultSupplierBuilder<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CachedResultSupplierBuilder")
            .field("prefetch_strategy", &self.prefetch_strategy)
            .field("stale_value_behavior", &self.stale_value_behavior)
            .field("jitter", &self.jitter)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<T, C> CachedResultSupplierBuilder<T, C> {
    /// Sets the prefetch strategy
    pub fn prefetch_strategy(mut self, strategy: impl PrefetchStrategy + 'static) -> Self {
        self.prefetch_strategy = Box::new(strategy);
        self
    }

    /// Sets the stale-value behavior
    pub fn stale_value_behavior(mut self, behavior: StaleValueBehavior) -> Self {
        self.stale_value_behavior = behavior;
        self
    }

    /// Sets the jitter source applied to refreshed lifecycle points
    pub fn jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Sets a custom clock
    ///
    /// Useful for testing purposes
    pub fn clock<D: Clock>(self, clock: D) -> CachedResultSupplierBuilder<T, D> {
        CachedResultSupplierBuilder {
            refresh_fn: self.refresh_fn,
            prefetch_strategy: self.prefetch_strategy,
            stale_value_behavior: self.stale_value_behavior,
            jitter: self.jitter,
            clock,
        }
    }

    /// Builds the supplier
    pub fn build(self) -> CachedResultSupplier<T, C> {
        CachedResultSupplier {
            state: Arc::new(SupplierState {
                refresh_fn: self.refresh_fn,
                cached: RwLock::new(None),
                refresh_lock: tokio::sync::Mutex::new(()),
                prefetch_strategy: self.prefetch_strategy,
                stale_value_behavior: self.stale_value_behavior,
                jitter: self.jitter,
                clock: self.clock,
            }),
        }
    }
}
