//! Shared HTTP transport
//!
//! The crate keeps one pooled [`reqwest::Client`] per process. The first
//! caller's [`HttpConfiguration`] wins; later calls reuse the existing pool
//! regardless of the configuration they pass. Providers accept an explicit
//! client for callers that need different transport settings per provider.

use std::sync::OnceLock;

use crate::{
    config::HttpConfiguration,
    error::{codes, Error},
};

static SHARED: OnceLock<reqwest::Client> = OnceLock::new();

/// The user agent identifying this client to remote endpoints
pub const USER_AGENT: &str = concat!("cloud-idaas-rust/", env!("CARGO_PKG_VERSION"));

/// Builds a standalone HTTP client from the given configuration
pub fn build_client(config: &HttpConfiguration) -> Result<reqwest::Client, Error> {
    config.validate()?;
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(config.connect_timeout())
        .timeout(config.read_timeout())
        .danger_accept_invalid_certs(config.unsafe_ignore_ssl_cert)
        .build()
        .map_err(|err| Error::Http {
            code: codes::HTTP_CLIENT_INIT_FAILED,
            message: err.to_string(),
            source: Some(err),
        })
}

/// Gets a handle to the process-wide HTTP client, initializing it on first
/// use with the given configuration
///
/// The returned client is a cheap handle onto the shared connection pool
/// and is safe for concurrent use.
pub fn shared_client(config: &HttpConfiguration) -> Result<reqwest::Client, Error> {
    if let Some(client) = SHARED.get() {
        return Ok(client.clone());
    }
    let built = build_client(config)?;
    Ok(SHARED.get_or_init(|| built).clone())
}
