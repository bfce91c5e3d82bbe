//! The token response model
//!
//! [`TokenResponse`] is the typed result of a successful token request. The
//! token endpoint reports a relative lifetime (`expires_in`); the client
//! pins it to an absolute wall-clock instant (`expires_at`) at receipt so
//! that lifecycle decisions are independent of when the response is
//! inspected.

use aliri_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef, IdToken, IdTokenRef, RefreshToken, RefreshTokenRef};

/// Tokens with lifetimes shorter than this collapse to a single refresh
/// point just before expiry.
const MIN_LIFETIME_FOR_WINDOWS: DurationSecs = DurationSecs(15);

/// A successful response from the token endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<IdToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    expires_in: DurationSecs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<UnixTime>,
}

impl TokenResponse {
    /// Constructs a token response from an access token and lifetime
    pub fn new(access_token: AccessToken, expires_in: DurationSecs) -> Self {
        Self {
            access_token,
            token_type: None,
            id_token: None,
            refresh_token: None,
            expires_in,
            expires_at: None,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the token type, if reported
    #[inline]
    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    /// Gets the ID token, if present
    #[inline]
    pub fn id_token(&self) -> Option<&IdTokenRef> {
        self.id_token.as_deref()
    }

    /// Gets the refresh token, if present
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the token's relative lifetime as reported by the server
    #[inline]
    pub fn expires_in(&self) -> DurationSecs {
        self.expires_in
    }

    /// Gets the absolute expiry instant, if known
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Pins the absolute expiry to `now + expires_in` when the server
    /// omitted it
    pub fn ensure_expires_at(&mut self, now: UnixTime) {
        if self.expires_at.is_none() {
            self.expires_at = Some(now + self.expires_in);
        }
    }

    fn expiry_or(&self, now: UnixTime) -> UnixTime {
        self.expires_at.unwrap_or(now + self.expires_in)
    }

    /// The instant after which the token must not be served without a refresh
    ///
    /// Falls at 4/5 of the token's lifetime. Tokens shorter than 15 seconds
    /// collapse to one second before expiry.
    pub fn stale_time(&self, now: UnixTime) -> UnixTime {
        let expiry = self.expiry_or(now);
        if self.expires_in < MIN_LIFETIME_FOR_WINDOWS {
            return (expiry - DurationSecs(1)).max(now);
        }
        expiry - self.expires_in / 5
    }

    /// The instant after which reads should trigger a background refresh
    ///
    /// Falls at 2/3 of the token's lifetime. Tokens shorter than 15 seconds
    /// collapse to one second before expiry.
    pub fn prefetch_time(&self, now: UnixTime) -> UnixTime {
        let expiry = self.expiry_or(now);
        if self.expires_in < MIN_LIFETIME_FOR_WINDOWS {
            return (expiry - DurationSecs(1)).max(now);
        }
        expiry - self.expires_in / 3
    }

    /// Whether the token is within the final 15% of its lifetime
    pub fn will_soon_expire(&self, now: UnixTime) -> bool {
        let remaining = self.expiry_or(now).0.saturating_sub(now.0);
        self.expires_in * 0.15 > DurationSecs(remaining)
    }
}
