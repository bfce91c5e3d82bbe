//! Credential providers and the authentication material that feeds them
//!
//! [`MachineCredentialProvider`] is the front door: it binds a cached
//! result supplier to a method-specific token request. The narrow traits
//! here supply the per-method inputs (a signed client assertion, a
//! federated OIDC token, or a PKCS7 attested document) and have both
//! static holders and live implementations backed by the environment, the
//! filesystem, or a cloud metadata service.

use async_trait::async_trait;

use crate::{ClientAssertion, ClientIdRef, Error, OidcToken, Pkcs7Document};

mod assertion;
mod machine;
mod oidc;
mod pkcs7;

pub use assertion::{
    EnvClientSecretAssertionProvider, EnvPrivateKeyAssertionProvider,
    StaticClientSecretAssertionProvider, StaticPrivateKeyAssertionProvider,
};
pub use machine::{MachineCredentialProvider, MachineCredentialProviderBuilder};
pub use oidc::{FileOidcTokenProvider, StaticOidcTokenProvider};
pub use pkcs7::{
    AlibabaCloudEcsAttestedDocumentProvider, AwsEc2Pkcs7AttestedDocumentProvider,
    StaticPkcs7AttestedDocumentProvider,
};

/// Supplies signed JWT client assertions (RFC 7523)
///
/// Implementations regenerate the assertion on every call so that `iat`,
/// `exp`, and `jti` are fresh.
pub trait ClientAssertionProvider: Send + Sync {
    /// Produces a client assertion for the given client and token endpoint
    fn client_assertion(
        &self,
        client_id: &ClientIdRef,
        token_endpoint: &str,
    ) -> Result<ClientAssertion, Error>;
}

/// Supplies federated OIDC tokens
#[async_trait]
pub trait OidcTokenProvider: Send + Sync {
    /// Produces the current OIDC token
    async fn oidc_token(&self) -> Result<OidcToken, Error>;
}

/// Supplies PKCS7-signed attested documents
#[async_trait]
pub trait Pkcs7AttestedDocumentProvider: Send + Sync {
    /// Produces the current attested document
    async fn attested_document(&self) -> Result<Pkcs7Document, Error>;
}
