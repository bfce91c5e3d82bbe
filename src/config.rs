//! Typed client configuration
//!
//! The structures here are the configuration surface consumed by the
//! credential providers. Discovery and parsing of configuration files is a
//! loader concern; deserialization accepts both camelCase and snake_case
//! keys so loaders need not normalize before handing data over.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{
    error::{codes, Error},
    ClientId,
};

/// The default OAuth2 scope requested for machine credentials
pub const DEFAULT_SCOPE: &str = "urn:cloud:idaas:pam|cloud_account:obtain_access_credential";

/// The environment variable consulted for the client secret when no
/// explicit variable name is configured
pub const DEFAULT_CLIENT_SECRET_ENV_VAR: &str = "CLOUD_IDAAS_CLIENT_SECRET";

const MIN_TIMEOUT_MILLIS: u64 = 2_000;
const MAX_TIMEOUT_MILLIS: u64 = 60_000;

/// The client authentication method used at the token endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenAuthnMethod {
    /// Client secret presented through HTTP Basic authentication
    ClientSecretBasic,
    /// Client secret posted in the form body
    ClientSecretPost,
    /// JWT client assertion signed with the client secret (HS256)
    ClientSecretJwt,
    /// JWT client assertion signed with a private key (RS256/ES256)
    PrivateKeyJwt,
    /// PKCS7-signed attested document from a cloud metadata service
    Pkcs7,
    /// Federated OIDC token
    Oidc,
    /// Private certificate authority: private-key assertion plus an X.509 chain
    Pca,
}

impl TokenAuthnMethod {
    /// The canonical configuration name for this method
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientSecretBasic => "CLIENT_SECRET_BASIC",
            Self::ClientSecretPost => "CLIENT_SECRET_POST",
            Self::ClientSecretJwt => "CLIENT_SECRET_JWT",
            Self::PrivateKeyJwt => "PRIVATE_KEY_JWT",
            Self::Pkcs7 => "PKCS7",
            Self::Oidc => "OIDC",
            Self::Pca => "PCA",
        }
    }
}

impl fmt::Display for TokenAuthnMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenAuthnMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLIENT_SECRET_BASIC" => Ok(Self::ClientSecretBasic),
            "CLIENT_SECRET_POST" => Ok(Self::ClientSecretPost),
            "CLIENT_SECRET_JWT" => Ok(Self::ClientSecretJwt),
            "PRIVATE_KEY_JWT" => Ok(Self::PrivateKeyJwt),
            "PKCS7" => Ok(Self::Pkcs7),
            "OIDC" => Ok(Self::Oidc),
            "PCA" => Ok(Self::Pca),
            other => Err(Error::config(
                codes::UNSUPPORTED_AUTHENTICATION_METHOD,
                format!("unsupported authentication method: {other}"),
            )),
        }
    }
}

/// HTTP transport configuration
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfiguration {
    /// Connect timeout in milliseconds
    #[serde(alias = "connectTimeout", alias = "connect_timeout")]
    pub connect_timeout_millis: u64,

    /// Read timeout in milliseconds
    #[serde(alias = "readTimeout", alias = "read_timeout")]
    pub read_timeout_millis: u64,

    /// Disables certificate verification; never enable outside of testing
    #[serde(alias = "unsafeIgnoreSslCert")]
    pub unsafe_ignore_ssl_cert: bool,
}

impl Default for HttpConfiguration {
    fn default() -> Self {
        Self {
            connect_timeout_millis: 5_000,
            read_timeout_millis: 10_000,
            unsafe_ignore_ssl_cert: false,
        }
    }
}

impl HttpConfiguration {
    /// The connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    /// The read timeout as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_millis)
    }

    /// Validates that both timeouts fall within the permitted 2–60 second range
    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_TIMEOUT_MILLIS..=MAX_TIMEOUT_MILLIS).contains(&self.connect_timeout_millis) {
            return Err(Error::config(
                codes::CONNECT_TIMEOUT_NOT_VALID,
                format!(
                    "connect timeout must be between {MIN_TIMEOUT_MILLIS} and \
                     {MAX_TIMEOUT_MILLIS} milliseconds, got {}",
                    self.connect_timeout_millis
                ),
            ));
        }
        if !(MIN_TIMEOUT_MILLIS..=MAX_TIMEOUT_MILLIS).contains(&self.read_timeout_millis) {
            return Err(Error::config(
                codes::READ_TIMEOUT_NOT_VALID,
                format!(
                    "read timeout must be between {MIN_TIMEOUT_MILLIS} and \
                     {MAX_TIMEOUT_MILLIS} milliseconds, got {}",
                    self.read_timeout_millis
                ),
            ));
        }
        Ok(())
    }
}

/// Authentication configuration for a machine client
///
/// Secrets are referenced indirectly by environment-variable name and are
/// read at refresh time, so operators may rotate them without a restart.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthnConfig {
    /// The client authentication method
    #[serde(alias = "authnMethod")]
    pub authn_method: TokenAuthnMethod,

    /// Environment variable holding the client secret
    #[serde(default, alias = "clientSecretEnvVarName")]
    pub client_secret_env_var_name: Option<String>,

    /// Environment variable holding the PEM-encoded private key
    #[serde(default, alias = "privateKeyEnvVarName")]
    pub private_key_env_var_name: Option<String>,

    /// Name of the federated credential registered with the identity platform
    #[serde(default, alias = "applicationFederatedCredentialName")]
    pub application_federated_credential_name: Option<String>,

    /// Path to the file holding the OIDC token
    #[serde(default, alias = "oidcTokenFilePath")]
    pub oidc_token_file_path: Option<PathBuf>,

    /// The client X.509 certificate, PEM-encoded
    #[serde(default, alias = "clientX509Certificate")]
    pub client_x509_certificate: Option<String>,

    /// The X.509 certificate chain, PEM-encoded
    #[serde(default, alias = "x509CertChains")]
    pub x509_cert_chains: Option<String>,
}

/// Top-level configuration for a machine credential client
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    /// The IDaaS instance ID
    #[serde(default, alias = "idaasInstanceId", alias = "idaas_instance_id")]
    pub instance_id: Option<String>,

    /// The OAuth2 client ID
    #[serde(alias = "clientId")]
    pub client_id: ClientId,

    /// The OAuth2 scope to request
    #[serde(default = "default_scope")]
    pub scope: String,

    /// The token endpoint URL
    #[serde(alias = "tokenEndpoint")]
    pub token_endpoint: String,

    /// The issuer URL
    #[serde(default)]
    pub issuer: Option<String>,

    /// HTTP transport configuration
    #[serde(default, alias = "httpConfiguration", alias = "http_configuration")]
    pub http: HttpConfiguration,

    /// Authentication configuration
    #[serde(alias = "authnConfiguration", alias = "authn_configuration")]
    pub authn: Option<AuthnConfig>,
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_owned()
}

impl ClientConfig {
    /// Validates the configuration, including per-method material requirements
    pub fn validate(&self) -> Result<(), Error> {
        if self.client_id.as_str().trim().is_empty() {
            return Err(Error::config(codes::CLIENT_ID_NOT_FOUND, "clientId is blank"));
        }
        if self.scope.trim().is_empty() {
            return Err(Error::config(codes::SCOPE_NOT_FOUND, "scope is blank"));
        }
        if self.token_endpoint.trim().is_empty() {
            return Err(Error::config(
                codes::TOKEN_ENDPOINT_NOT_FOUND,
                "tokenEndpoint is blank",
            ));
        }
        if reqwest::Url::parse(&self.token_endpoint).is_err() {
            return Err(Error::config(
                codes::TOKEN_ENDPOINT_NOT_FOUND,
                format!("tokenEndpoint is not a valid URL: {}", self.token_endpoint),
            ));
        }
        self.http.validate()?;

        let authn = self.authn.as_ref().ok_or_else(|| {
            Error::config(
                codes::AUTHN_CONFIGURATION_NOT_FOUND,
                "authentication configuration is missing",
            )
        })?;

        let require = |value: Option<&str>, code: &'static str, what: &str| {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(()),
                _ => Err(Error::config(
                    code,
                    format!("{what} is required for {}", authn.authn_method),
                )),
            }
        };

        match authn.authn_method {
            TokenAuthnMethod::ClientSecretBasic
            | TokenAuthnMethod::ClientSecretPost
            | TokenAuthnMethod::ClientSecretJwt => {}
            TokenAuthnMethod::PrivateKeyJwt => {
                require(
                    authn.private_key_env_var_name.as_deref(),
                    codes::PRIVATE_KEY_ENV_VAR_NAME_NOT_FOUND,
                    "privateKeyEnvVarName",
                )?;
            }
            TokenAuthnMethod::Pkcs7 => {
                require(
                    authn.application_federated_credential_name.as_deref(),
                    codes::APPLICATION_FEDERATED_CREDENTIAL_NAME_NOT_FOUND,
                    "applicationFederatedCredentialName",
                )?;
                require(
                    self.instance_id.as_deref(),
                    codes::IDAAS_INSTANCE_ID_NOT_FOUND,
                    "idaasInstanceId",
                )?;
            }
            TokenAuthnMethod::Oidc => {
                require(
                    authn.application_federated_credential_name.as_deref(),
                    codes::APPLICATION_FEDERATED_CREDENTIAL_NAME_NOT_FOUND,
                    "applicationFederatedCredentialName",
                )?;
                if authn.oidc_token_file_path.is_none() {
                    return Err(Error::config(
                        codes::OIDC_TOKEN_FILE_PATH_NOT_FOUND,
                        "oidcTokenFilePath is required for OIDC",
                    ));
                }
            }
            TokenAuthnMethod::Pca => {
                require(
                    authn.application_federated_credential_name.as_deref(),
                    codes::APPLICATION_FEDERATED_CREDENTIAL_NAME_NOT_FOUND,
                    "applicationFederatedCredentialName",
                )?;
                require(
                    authn.private_key_env_var_name.as_deref(),
                    codes::PRIVATE_KEY_ENV_VAR_NAME_NOT_FOUND,
                    "privateKeyEnvVarName",
                )?;
                require(
                    authn.client_x509_certificate.as_deref(),
                    codes::CLIENT_X509_CERTIFICATE_NOT_FOUND,
                    "clientX509Certificate",
                )?;
                require(
                    authn.x509_cert_chains.as_deref(),
                    codes::X509_CERT_CHAINS_NOT_FOUND,
                    "x509CertChains",
                )?;
            }
        }

        Ok(())
    }
}
