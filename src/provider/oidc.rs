//! OIDC token providers

use std::path::PathBuf;

use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use async_trait::async_trait;
use serde::Deserialize;

use super::OidcTokenProvider;
use crate::{
    error::{codes, Error},
    OidcToken,
};

/// How close to its `exp` claim a cached token is considered expiring
const EXPIRY_SKEW: DurationSecs = DurationSecs(600);

/// Serves a fixed OIDC token
#[derive(Debug)]
pub struct StaticOidcTokenProvider {
    token: OidcToken,
}

impl StaticOidcTokenProvider {
    /// Constructs a provider serving `token`
    pub fn new(token: OidcToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl OidcTokenProvider for StaticOidcTokenProvider {
    async fn oidc_token(&self) -> Result<OidcToken, Error> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Default)]
struct CachedOidcToken {
    token: Option<OidcToken>,
    expires: Option<UnixTime>,
}

/// Reads an OIDC token from a file, re-reading as expiry approaches
///
/// The token's `exp` claim is parsed (without signature verification) on
/// first read and the raw token cached; the file is read again once the
/// token is within ten minutes of expiring. Tokens whose expiry cannot be
/// parsed are re-read on every call.
#[derive(Debug)]
pub struct FileOidcTokenProvider<C = System> {
    path: PathBuf,
    cached: tokio::sync::Mutex<CachedOidcToken>,
    clock: C,
}

impl FileOidcTokenProvider {
    /// Constructs a provider reading from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: tokio::sync::Mutex::new(CachedOidcToken::default()),
            clock: System,
        }
    }
}

impl<C> FileOidcTokenProvider<C> {
    /// The path the token is read from
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Sets a custom clock
    ///
    /// Useful for testing purposes
    pub fn with_clock<D: Clock>(self, clock: D) -> FileOidcTokenProvider<D> {
        FileOidcTokenProvider {
            path: self.path,
            cached: self.cached,
            clock,
        }
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> OidcTokenProvider for FileOidcTokenProvider<C> {
    async fn oidc_token(&self) -> Result<OidcToken, Error> {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now();

        if let (Some(token), Some(expires)) = (&cached.token, cached.expires) {
            if now + EXPIRY_SKEW < expires {
                return Ok(token.clone());
            }
        }

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| {
                Error::credential_with(
                    codes::OIDC_TOKEN_READ_FAILED,
                    format!("failed to read the OIDC token from {}", self.path.display()),
                    err,
                )
            })?;
        let raw = raw.trim().to_owned();

        cached.expires = parse_expiration(&raw);
        if cached.expires.is_none() {
            tracing::warn!(
                path = %self.path.display(),
                "unable to parse an expiry from the OIDC token; it will be re-read on every call"
            );
        }

        let token = OidcToken::from(raw);
        cached.token = Some(token.clone());
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct ExpClaim {
    exp: Option<u64>,
}

fn parse_expiration(token: &str) -> Option<UnixTime> {
    let mut validation = jsonwebtoken::Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let decoded = jsonwebtoken::decode::<ExpClaim>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(&[]),
        &validation,
    )
    .ok()?;
    decoded.claims.exp.map(UnixTime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aliri_clock::TestClock;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: u64,
    }

    fn signed_token(exp: u64) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                sub: "machine".to_owned(),
                exp,
            },
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn caches_until_expiry_approaches() {
        let now = UnixTime(1_700_000_000);
        let clock = TestClock::new(now);

        let file = tempfile::NamedTempFile::new().unwrap();
        let first = signed_token(now.0 + 3_600);
        std::fs::write(file.path(), &first).unwrap();

        let provider = FileOidcTokenProvider::new(file.path()).with_clock(clock.clone());
        assert_eq!(provider.oidc_token().await.unwrap().as_str(), first);

        // the file changes, but the cached token is still far from expiry
        let second = signed_token(now.0 + 7_200);
        std::fs::write(file.path(), &second).unwrap();
        assert_eq!(provider.oidc_token().await.unwrap().as_str(), first);

        // within ten minutes of expiry the file is read again
        clock.set(UnixTime(now.0 + 3_600 - 599));
        assert_eq!(provider.oidc_token().await.unwrap().as_str(), second);
    }

    #[tokio::test]
    async fn unparseable_tokens_are_reread_every_call() {
        let clock = TestClock::new(UnixTime(1_700_000_000));

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "not-a-jwt").unwrap();

        let provider = FileOidcTokenProvider::new(file.path()).with_clock(clock);
        assert_eq!(provider.oidc_token().await.unwrap().as_str(), "not-a-jwt");

        std::fs::write(file.path(), "still-not-a-jwt").unwrap();
        assert_eq!(
            provider.oidc_token().await.unwrap().as_str(),
            "still-not-a-jwt"
        );
    }

    #[tokio::test]
    async fn missing_files_surface_a_credential_error() {
        let provider = FileOidcTokenProvider::new("/nonexistent/oidc-token");
        let err = provider.oidc_token().await.unwrap_err();
        assert_eq!(err.code(), codes::OIDC_TOKEN_READ_FAILED);
    }
}
