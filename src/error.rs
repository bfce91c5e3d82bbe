//! Errors surfaced by the credential client
//!
//! Every error carries a stable error code, retrievable through
//! [`Error::code`], so that callers can branch on failure classes without
//! matching on display strings.

use thiserror::Error;

/// Stable error code identifiers
pub mod codes {
    /// The client ID is missing or blank
    pub const CLIENT_ID_NOT_FOUND: &str = "ClientIdNotFound";
    /// The token endpoint is missing or blank
    pub const TOKEN_ENDPOINT_NOT_FOUND: &str = "TokenEndpointNotFound";
    /// The scope is missing or blank
    pub const SCOPE_NOT_FOUND: &str = "ScopeNotFound";
    /// The IDaaS instance ID is missing or blank
    pub const IDAAS_INSTANCE_ID_NOT_FOUND: &str = "IDaaSInstanceIdNotFound";
    /// No authentication configuration was provided
    pub const AUTHN_CONFIGURATION_NOT_FOUND: &str = "AuthnConfigurationNotFound";
    /// The private key environment variable name is missing
    pub const PRIVATE_KEY_ENV_VAR_NAME_NOT_FOUND: &str = "PrivateKeyEnvVarNameNotFound";
    /// The application federated credential name is missing
    pub const APPLICATION_FEDERATED_CREDENTIAL_NAME_NOT_FOUND: &str =
        "ApplicationFederatedCredentialNameNotFound";
    /// The OIDC token file path is missing
    pub const OIDC_TOKEN_FILE_PATH_NOT_FOUND: &str = "OidcTokenFilePathNotFound";
    /// The client X.509 certificate is missing
    pub const CLIENT_X509_CERTIFICATE_NOT_FOUND: &str = "ClientX509CertificateNotFound";
    /// The X.509 certificate chain is missing
    pub const X509_CERT_CHAINS_NOT_FOUND: &str = "X509CertChainsNotFound";
    /// No client assertion provider was configured for a JWT method
    pub const CLIENT_ASSERTION_PROVIDER_NOT_FOUND: &str = "ClientAssertionProviderNotFound";
    /// No attested document provider was configured for the PKCS7 method
    pub const ATTESTED_DOCUMENT_PROVIDER_NOT_FOUND: &str = "AttestedDocumentProviderNotFound";
    /// No OIDC token provider was configured for the OIDC method
    pub const OIDC_TOKEN_PROVIDER_NOT_FOUND: &str = "OidcTokenProviderNotFound";
    /// The configured authentication method is not supported
    pub const UNSUPPORTED_AUTHENTICATION_METHOD: &str = "UnsupportedAuthenticationMethod";
    /// The configured stale value behavior is not supported
    pub const UNSUPPORTED_STALE_VALUE_BEHAVIOR: &str = "UnsupportedStaleValueBehavior";
    /// The connect timeout is outside the allowed bounds
    pub const CONNECT_TIMEOUT_NOT_VALID: &str = "ConnectTimeoutNotValid";
    /// The read timeout is outside the allowed bounds
    pub const READ_TIMEOUT_NOT_VALID: &str = "ReadTimeoutNotValid";
    /// The document effective period is outside the allowed bounds
    pub const DOCUMENT_EFFECTIVE_SECONDS_NOT_VALID: &str = "DocumentEffectiveSecondsNotValid";

    /// The client secret environment variable is unset or empty
    pub const CLIENT_SECRET_NOT_FOUND: &str = "ClientSecretNotFound";
    /// The private key environment variable is unset or empty
    pub const PRIVATE_KEY_NOT_FOUND: &str = "PrivateKeyNotFound";
    /// The OIDC token file could not be read
    pub const OIDC_TOKEN_READ_FAILED: &str = "OidcTokenReadFailed";
    /// Signing the client assertion failed
    pub const CLIENT_ASSERTION_SIGN_FAILED: &str = "ClientAssertionSignFailed";
    /// The requested operation is not implemented
    pub const NOT_IMPLEMENTED: &str = "NotImplemented";

    /// The private key PEM could not be parsed
    pub const MALFORMED_PRIVATE_KEY: &str = "MalformedPrivateKey";
    /// The private key type is not supported for signing
    pub const NOT_SUPPORTED_WEB_KEY: &str = "NotSupportedWebKey";
    /// The token endpoint response body could not be parsed
    pub const MALFORMED_TOKEN_RESPONSE: &str = "MalformedTokenResponse";

    /// The connection to the remote endpoint timed out
    pub const CONNECT_TIME_OUT: &str = "ConnectTimeOut";
    /// Reading the response from the remote endpoint timed out
    pub const READ_TIME_OUT: &str = "ReadTimeOut";
    /// The HTTP request failed at the transport level
    pub const HTTP_REQUEST_FAILED: &str = "HttpRequestFailed";
    /// The HTTP client could not be constructed
    pub const HTTP_CLIENT_INIT_FAILED: &str = "HttpClientInitFailed";

    /// A cache refresh failed with no usable previous value
    pub const CACHE_REFRESH_FAILED: &str = "CacheRefreshFailed";
    /// A concurrent operation caused the current operation to fail
    pub const CONCURRENT_OPERATION_FAILED: &str = "ConcurrentOperationFailed";
}

/// An error raised while acquiring or maintaining a credential
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The client configuration is invalid or incomplete
    #[error("{code}: {message}")]
    Config {
        /// Stable error code
        code: &'static str,
        /// Human-readable description
        message: String,
    },

    /// Authentication material could not be obtained
    #[error("{code}: {message}")]
    Credential {
        /// Stable error code
        code: &'static str,
        /// Human-readable description
        message: String,
        /// The underlying cause, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Key or token material is malformed
    #[error("{code}: {message}")]
    Encoding {
        /// Stable error code
        code: &'static str,
        /// Human-readable description
        message: String,
        /// The underlying cause, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// The HTTP request failed at the transport level
    #[error("{code}: {message}")]
    Http {
        /// Stable error code
        code: &'static str,
        /// Human-readable description
        message: String,
        /// The underlying transport error
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The remote endpoint rejected the request (4xx)
    #[error("{error_code}: {}", .error_description.as_deref().unwrap_or("the remote endpoint rejected the request"))]
    Client {
        /// The OAuth2 error code, or the HTTP status when no body was provided
        error_code: String,
        /// The OAuth2 error description, if provided
        error_description: Option<String>,
        /// The request ID reported by the remote endpoint, if any
        request_id: Option<String>,
    },

    /// The remote endpoint failed to process the request (5xx)
    #[error("{error_code}: {}", .error_description.as_deref().unwrap_or("the remote endpoint failed to process the request"))]
    Server {
        /// The error code, or the HTTP status when no body was provided
        error_code: String,
        /// The error description, if provided
        error_description: Option<String>,
        /// The request ID reported by the remote endpoint, if any
        request_id: Option<String>,
    },

    /// A cache refresh failed and the policy forbids returning a stale value
    #[error("CacheRefreshFailed: unable to refresh the cached value")]
    Cache {
        /// The error raised by the refresh operation
        #[source]
        source: Box<Error>,
    },

    /// A concurrent operation caused the current operation to fail
    #[error(
        "ConcurrentOperationFailed: a concurrent operation is in progress, \
         causing the current operation to fail"
    )]
    ConcurrentOperation,
}

impl Error {
    /// Constructs a configuration error
    pub fn config(code: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
        }
    }

    /// Constructs a credential error
    pub fn credential(code: &'static str, message: impl Into<String>) -> Self {
        Self::Credential {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Constructs a credential error wrapping an underlying cause
    pub fn credential_with(
        code: &'static str,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Credential {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Constructs an encoding error
    pub fn encoding(code: &'static str, message: impl Into<String>) -> Self {
        Self::Encoding {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Constructs an encoding error wrapping an underlying cause
    pub fn encoding_with(
        code: &'static str,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Encoding {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The stable error code identifying this failure
    pub fn code(&self) -> &str {
        match self {
            Self::Config { code, .. }
            | Self::Credential { code, .. }
            | Self::Encoding { code, .. }
            | Self::Http { code, .. } => code,
            Self::Client { error_code, .. } | Self::Server { error_code, .. } => error_code,
            Self::Cache { .. } => codes::CACHE_REFRESH_FAILED,
            Self::ConcurrentOperation => codes::CONCURRENT_OPERATION_FAILED,
        }
    }

    /// The innermost error, unwrapping any cache-layer wrapping
    ///
    /// A refresh failure surfaced through the cache arrives wrapped in
    /// [`Error::Cache`]; this peels that layer off so callers can inspect
    /// the original authentication or transport failure.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Cache { source } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = Error::config(codes::CLIENT_ID_NOT_FOUND, "clientId is blank");
        assert_eq!(err.code(), "ClientIdNotFound");
        assert_eq!(err.to_string(), "ClientIdNotFound: clientId is blank");
    }

    #[test]
    fn cache_error_preserves_root_cause() {
        let inner = Error::Client {
            error_code: "invalid_client".to_owned(),
            error_description: Some("bad secret".to_owned()),
            request_id: Some("r-42".to_owned()),
        };
        let wrapped = Error::Cache {
            source: Box::new(inner),
        };
        assert_eq!(wrapped.code(), "CacheRefreshFailed");
        assert_eq!(wrapped.root_cause().code(), "invalid_client");
    }
}
