//! Time-based caching of refreshed values
//!
//! The cache distinguishes three lifecycle phases for an entry. While the
//! entry is *fresh*, reads return immediately. Once the *prefetch* point
//! passes, reads still return the current value but hand a refresh off to
//! the configured [`PrefetchStrategy`] so the entry is renewed before anyone
//! has to wait for it. Once the *stale* point passes, reads block on a
//! single-flight refresh.
//!
//! Successful refreshes have their lifecycle points pushed later by a
//! random jitter so that cooperating processes do not renew in lockstep.

mod prefetch;
mod refresh_result;
mod supplier;
pub mod worker;

use std::str::FromStr;

use serde::Deserialize;

pub use prefetch::{
    NonBlockingPrefetchStrategy, OneCallerBlocksPrefetchStrategy, PrefetchStrategy, RefreshFuture,
};
pub use refresh_result::{RefreshResult, RefreshResultBuilder};
pub use supplier::{CachedResultSupplier, CachedResultSupplierBuilder};

/// How the cache behaves when a refresh fails while a previous value is
/// still held
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StaleValueBehavior {
    /// Refresh failures are surfaced to the caller
    Strict,
    /// The previous value is returned and the failure is logged
    #[default]
    Allow,
}

impl FromStr for StaleValueBehavior {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STRICT" => Ok(Self::Strict),
            "ALLOW" => Ok(Self::Allow),
            other => Err(crate::Error::config(
                crate::error::codes::UNSUPPORTED_STALE_VALUE_BEHAVIOR,
                format!("unsupported stale value behavior: {other}"),
            )),
        }
    }
}
