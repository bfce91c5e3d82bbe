use aliri_clock::UnixTime;

use crate::jitter::JitterSource;

/// The result of a refresh: a value together with its lifecycle points
///
/// `stale_time` is the instant after which callers must block on a new
/// refresh; `prefetch_time` is the earlier instant after which reads should
/// trigger a background refresh. Either may be omitted, in which case the
/// corresponding transition never occurs. The result is immutable once
/// built; construction clamps `prefetch_time` so that it never falls after
/// `stale_time`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshResult<T> {
    value: T,
    stale_time: Option<UnixTime>,
    prefetch_time: Option<UnixTime>,
    expiry: Option<UnixTime>,
}

impl<T> RefreshResult<T> {
    /// Starts building a refresh result around `value`
    pub fn builder(value: T) -> RefreshResultBuilder<T> {
        RefreshResultBuilder {
            value,
            stale_time: None,
            prefetch_time: None,
            expiry: None,
        }
    }

    /// Gets the cached value
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Gets the instant after which callers block on a refresh
    #[inline]
    pub fn stale_time(&self) -> Option<UnixTime> {
        self.stale_time
    }

    /// Gets the instant after which reads trigger a background refresh
    #[inline]
    pub fn prefetch_time(&self) -> Option<UnixTime> {
        self.prefetch_time
    }

    /// Gets the hard expiry bound, if one was provided
    #[inline]
    pub fn expiry(&self) -> Option<UnixTime> {
        self.expiry
    }

    /// Whether the entry requires a blocking refresh as of `now`
    #[inline]
    pub fn is_stale_at(&self, now: UnixTime) -> bool {
        self.stale_time.is_some_and(|t| now >= t)
    }

    /// Whether a read at `now` should trigger a background refresh
    #[inline]
    pub fn should_prefetch_at(&self, now: UnixTime) -> bool {
        self.prefetch_time.is_some_and(|t| now >= t)
    }

    /// Pushes both lifecycle points later through `jitter`, clamped so that
    /// `prefetch_time <= stale_time <= expiry` still holds
    pub(crate) fn apply_jitter(&mut self, jitter: &dyn JitterSource) {
        if let Some(stale) = self.stale_time {
            let mut jittered = jitter.jitter(stale);
            if let Some(expiry) = self.expiry {
                jittered = jittered.min(expiry);
            }
            self.stale_time = Some(jittered);
        }
        if let Some(prefetch) = self.prefetch_time {
            let mut jittered = jitter.jitter(prefetch);
            if let Some(expiry) = self.expiry {
                jittered = jittered.min(expiry);
            }
            if let Some(stale) = self.stale_time {
                jittered = jittered.min(stale);
            }
            self.prefetch_time = Some(jittered);
        }
    }
}

/// Builder for [`RefreshResult`]
#[derive(Clone, Debug)]
pub struct RefreshResultBuilder<T> {
    value: T,
    stale_time: Option<UnixTime>,
    prefetch_time: Option<UnixTime>,
    expiry: Option<UnixTime>,
}

impl<T> RefreshResultBuilder<T> {
    /// Sets the instant after which callers block on a refresh
    pub fn stale_time(mut self, stale_time: UnixTime) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Sets the instant after which reads trigger a background refresh
    pub fn prefetch_time(mut self, prefetch_time: UnixTime) -> Self {
        self.prefetch_time = Some(prefetch_time);
        self
    }

    /// Sets a hard expiry bound that jittered lifecycle points never exceed
    pub fn expiry(mut self, expiry: UnixTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Builds the result, clamping `prefetch_time` to `stale_time`
    pub fn build(self) -> RefreshResult<T> {
        let prefetch_time = match (self.prefetch_time, self.stale_time) {
            (Some(p), Some(s)) => Some(p.min(s)),
            (p, _) => p,
        };
        RefreshResult {
            value: self.value,
            stale_time: self.stale_time,
            prefetch_time,
            expiry: self.expiry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitter::{NullJitter, RandomLateJitter};

    #[test]
    fn prefetch_never_follows_stale() {
        let result = RefreshResult::builder("v")
            .stale_time(UnixTime(100))
            .prefetch_time(UnixTime(500))
            .build();

        assert_eq!(result.prefetch_time(), Some(UnixTime(100)));
        assert_eq!(result.stale_time(), Some(UnixTime(100)));
    }

    #[test]
    fn omitted_points_never_trigger() {
        let result = RefreshResult::builder("v").build();
        assert!(!result.is_stale_at(UnixTime(u64::MAX)));
        assert!(!result.should_prefetch_at(UnixTime(u64::MAX)));
    }

    #[test]
    fn lifecycle_checks_are_inclusive() {
        let result = RefreshResult::builder("v")
            .stale_time(UnixTime(200))
            .prefetch_time(UnixTime(100))
            .build();

        assert!(!result.should_prefetch_at(UnixTime(99)));
        assert!(result.should_prefetch_at(UnixTime(100)));
        assert!(!result.is_stale_at(UnixTime(199)));
        assert!(result.is_stale_at(UnixTime(200)));
    }

    #[test]
    fn jitter_pushes_points_later_within_bounds() {
        for _ in 0..200 {
            let mut result = RefreshResult::builder("v")
                .stale_time(UnixTime(10_000))
                .prefetch_time(UnixTime(8_000))
                .build();
            result.apply_jitter(&RandomLateJitter::default());

            let stale = result.stale_time().unwrap();
            let prefetch = result.prefetch_time().unwrap();
            assert!((10_300..10_600).contains(&stale.0));
            assert!((8_300..8_600).contains(&prefetch.0));
            assert!(prefetch <= stale);
        }
    }

    #[test]
    fn jitter_is_clamped_to_expiry() {
        for _ in 0..200 {
            let mut result = RefreshResult::builder("v")
                .stale_time(UnixTime(10_000))
                .prefetch_time(UnixTime(9_900))
                .expiry(UnixTime(10_100))
                .build();
            result.apply_jitter(&RandomLateJitter::default());

            let stale = result.stale_time().unwrap();
            let prefetch = result.prefetch_time().unwrap();
            assert!(stale <= UnixTime(10_100));
            assert!(prefetch <= stale);
        }
    }

    #[test]
    fn null_jitter_leaves_points_untouched() {
        let mut result = RefreshResult::builder("v")
            .stale_time(UnixTime(10_000))
            .prefetch_time(UnixTime(8_000))
            .build();
        result.apply_jitter(&NullJitter);

        assert_eq!(result.stale_time(), Some(UnixTime(10_000)));
        assert_eq!(result.prefetch_time(), Some(UnixTime(8_000)));
    }
}
