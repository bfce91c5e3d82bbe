//! Machine-to-machine credentials for cloud IDaaS platforms
//!
//! This library acquires an OAuth2 access token on behalf of a non-human
//! principal and keeps it valid in the background, so that consumers of
//! the token need be hardly aware that refreshes are happening at all.
//! A cached token is served while it is fresh; once it ages into its
//! prefetch window a renewal is kicked off without holding up the caller,
//! and only a token allowed to go fully stale forces anyone to wait.
//! Refresh points are jittered so that fleets of instances started
//! together do not stampede the token endpoint in unison.
//!
//! Seven client authentication methods are supported: client secrets via
//! HTTP Basic or the form body, HS256 and RS256/ES256 JWT client
//! assertions, PKCS7-signed attested documents from a cloud metadata
//! service, federated OIDC tokens, and private-CA bound assertions.
//! Secrets are referenced by environment-variable name and read at
//! refresh time, so they can be rotated without a restart.
//!
//! # Getting a token
//!
//! ```no_run
//! use cloud_idaas::{
//!     cache::StaleValueBehavior, config::TokenAuthnMethod, MachineCredentialProvider,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), cloud_idaas::Error> {
//! let provider = MachineCredentialProvider::builder()
//!     .client_id("my-machine-client")
//!     .token_endpoint("https://idaas.example.com/oauth2/token")
//!     .authn_method(TokenAuthnMethod::ClientSecretPost)
//!     .stale_value_behavior(StaleValueBehavior::Allow)
//!     .build()?;
//!
//! let token = provider.get_bearer_token().await?;
//! tracing::info!(token = format_args!("{:#?}", token), "acquired bearer token");
//! # Ok(())
//! # }
//! ```
//!
//! The generic caching machinery lives in [`cache`] and can hold values
//! other than tokens; the ECS attested document provider uses it to keep
//! its metadata document warm the same way the credential provider keeps
//! its token warm.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod cache;
pub mod config;
mod credential;
pub mod error;
pub mod http;
pub mod jitter;
pub mod oauth2;
pub mod provider;

pub use braids::*;
pub use credential::TokenResponse;
pub use error::Error;
pub use provider::MachineCredentialProvider;
