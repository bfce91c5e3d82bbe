//! Utilities for adding a bit of jitter to reduce stampeding
//!
//! Peer processes started together would otherwise compute identical
//! refresh points and stampede the token endpoint in lockstep; pushing each
//! point later by a random amount decorrelates them.

use std::fmt;

use aliri_clock::{DurationSecs, UnixTime};
use rand::Rng;

/// A type that provides some jittering of time
pub trait JitterSource: Send + Sync + fmt::Debug {
    /// Jitters a given input time
    fn jitter(&self, time: UnixTime) -> UnixTime;
}

impl JitterSource for Box<dyn JitterSource> {
    #[inline]
    fn jitter(&self, time: UnixTime) -> UnixTime {
        (**self).jitter(time)
    }
}

/// A jitter source that does not do any jittering of time
#[derive(Clone, Copy, Debug, Default)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&self, time: UnixTime) -> UnixTime {
        time
    }
}

/// Jitters a value later by a random amount
///
/// Times jittered by this type will have a value with a uniform distribution
/// in the interval `[time + start, time + start + range)`.
#[derive(Clone, Copy, Debug)]
pub struct RandomLateJitter {
    start: DurationSecs,
    range: DurationSecs,
}

impl RandomLateJitter {
    /// Constructs a new instance that will jitter times later by at least
    /// `start` and at most `start + range`.
    pub fn new(start: DurationSecs, range: DurationSecs) -> Self {
        Self { start, range }
    }
}

impl Default for RandomLateJitter {
    /// Jitters times later by five to ten minutes
    fn default() -> Self {
        Self::new(DurationSecs(300), DurationSecs(300))
    }
}

impl JitterSource for RandomLateJitter {
    fn jitter(&self, time: UnixTime) -> UnixTime {
        if self.range.0 == 0 {
            return time + self.start;
        }
        let jitter = rand::thread_rng().gen_range(0..self.range.0);
        time + self.start + DurationSecs(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_jitter_is_identity() {
        let time = UnixTime(1_700_000_000);
        assert_eq!(NullJitter.jitter(time), time);
    }

    #[test]
    fn random_late_jitter_stays_within_bounds() {
        let jitter = RandomLateJitter::default();
        let time = UnixTime(1_700_000_000);

        for _ in 0..1_000 {
            let jittered = jitter.jitter(time);
            let offset = jittered - time;
            assert!(
                (300..600).contains(&offset.0),
                "offset {} outside [300, 600)",
                offset.0
            );
        }
    }

    #[test]
    fn zero_range_is_a_fixed_offset() {
        let jitter = RandomLateJitter::new(DurationSecs(60), DurationSecs(0));
        assert_eq!(jitter.jitter(UnixTime(100)), UnixTime(160));
    }
}
