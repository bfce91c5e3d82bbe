//! The machine credential provider

use std::{fmt, sync::Arc};

use aliri_clock::{Clock, System};

use super::{
    AlibabaCloudEcsAttestedDocumentProvider, ClientAssertionProvider,
    EnvClientSecretAssertionProvider, EnvPrivateKeyAssertionProvider, FileOidcTokenProvider,
    OidcTokenProvider, Pkcs7AttestedDocumentProvider,
};
use crate::{
    cache::{
        CachedResultSupplier, NonBlockingPrefetchStrategy, OneCallerBlocksPrefetchStrategy,
        RefreshResult, StaleValueBehavior,
    },
    config::{ClientConfig, TokenAuthnMethod, DEFAULT_CLIENT_SECRET_ENV_VAR, DEFAULT_SCOPE},
    error::{codes, Error},
    http,
    jitter::JitterSource,
    oauth2::{self, ClientAuthentication, TokenRequest},
    AccessToken, ClientId, ClientSecret, TokenResponse,
};

struct ProviderCore<C> {
    client_id: ClientId,
    scope: String,
    token_endpoint: String,
    authn_method: TokenAuthnMethod,
    client_secret_env_var_name: String,
    client_assertion_provider: Option<Arc<dyn ClientAssertionProvider>>,
    application_federated_credential_name: Option<String>,
    attested_document_provider: Option<Arc<dyn Pkcs7AttestedDocumentProvider>>,
    oidc_token_provider: Option<Arc<dyn OidcTokenProvider>>,
    client_x509_certificate: Option<String>,
    x509_cert_chains: Option<String>,
    http: reqwest::Client,
    clock: C,
}

impl<C: Clock + Send + Sync> ProviderCore<C> {
    fn client_secret_from_env(&self) -> Result<ClientSecret, Error> {
        match std::env::var(&self.client_secret_env_var_name) {
            Ok(secret) if !secret.trim().is_empty() => Ok(ClientSecret::from(secret)),
            _ => Err(Error::credential(
                codes::CLIENT_SECRET_NOT_FOUND,
                format!(
                    "client secret environment variable `{}` is unset or empty",
                    self.client_secret_env_var_name
                ),
            )),
        }
    }

    fn federated_credential_name(&self) -> Result<&str, Error> {
        self.application_federated_credential_name
            .as_deref()
            .ok_or_else(|| {
                Error::config(
                    codes::APPLICATION_FEDERATED_CREDENTIAL_NAME_NOT_FOUND,
                    format!(
                        "applicationFederatedCredentialName is required for {}",
                        self.authn_method
                    ),
                )
            })
    }

    fn assertion_provider(&self) -> Result<&dyn ClientAssertionProvider, Error> {
        self.client_assertion_provider
            .as_deref()
            .ok_or_else(|| {
                Error::config(
                    codes::CLIENT_ASSERTION_PROVIDER_NOT_FOUND,
                    format!(
                        "a client assertion provider is required for {}",
                        self.authn_method
                    ),
                )
            })
    }

    async fn token_request(&self) -> Result<TokenRequest, Error> {
        let authentication = match self.authn_method {
            TokenAuthnMethod::ClientSecretBasic => ClientAuthentication::SecretBasic {
                client_secret: self.client_secret_from_env()?,
            },
            TokenAuthnMethod::ClientSecretPost => ClientAuthentication::SecretPost {
                client_secret: self.client_secret_from_env()?,
            },
            TokenAuthnMethod::ClientSecretJwt | TokenAuthnMethod::PrivateKeyJwt => {
                ClientAuthentication::JwtAssertion {
                    assertion: self
                        .assertion_provider()?
                        .client_assertion(&self.client_id, &self.token_endpoint)?,
                }
            }
            TokenAuthnMethod::Pkcs7 => {
                let federated_credential_name = self.federated_credential_name()?.to_owned();
                let provider = self.attested_document_provider.as_deref().ok_or_else(|| {
                    Error::config(
                        codes::ATTESTED_DOCUMENT_PROVIDER_NOT_FOUND,
                        "an attested document provider is required for PKCS7",
                    )
                })?;
                ClientAuthentication::Pkcs7 {
                    federated_credential_name,
                    document: provider.attested_document().await?,
                }
            }
            TokenAuthnMethod::Oidc => {
                let federated_credential_name = self.federated_credential_name()?.to_owned();
                let provider = self.oidc_token_provider.as_deref().ok_or_else(|| {
                    Error::config(
                        codes::OIDC_TOKEN_PROVIDER_NOT_FOUND,
                        "an OIDC token provider is required for OIDC",
                    )
                })?;
                ClientAuthentication::Oidc {
                    federated_credential_name,
                    token: provider.oidc_token().await?,
                }
            }
            TokenAuthnMethod::Pca => {
                let federated_credential_name = self.federated_credential_name()?.to_owned();
                let client_x509 = self.client_x509_certificate.clone().ok_or_else(|| {
                    Error::config(
                        codes::CLIENT_X509_CERTIFICATE_NOT_FOUND,
                        "clientX509Certificate is required for PCA",
                    )
                })?;
                let client_x509_chain = self.x509_cert_chains.clone().ok_or_else(|| {
                    Error::config(
                        codes::X509_CERT_CHAINS_NOT_FOUND,
                        "x509CertChains is required for PCA",
                    )
                })?;
                ClientAuthentication::PrivateCa {
                    federated_credential_name,
                    assertion: self
                        .assertion_provider()?
                        .client_assertion(&self.client_id, &self.token_endpoint)?,
                    client_x509,
                    client_x509_chain,
                }
            }
        };

        Ok(TokenRequest {
            client_id: self.client_id.clone(),
            scope: self.scope.clone(),
            authentication,
        })
    }

    async fn refresh_credential(&self) -> Result<RefreshResult<TokenResponse>, Error> {
        let request = self.token_request().await?;
        let mut token = oauth2::request_token(&self.http, &self.token_endpoint, &request).await?;

        let now = self.clock.now();
        token.ensure_expires_at(now);

        let stale_time = token.stale_time(now);
        let prefetch_time = token.prefetch_time(now);
        let expiry = token.expires_at();

        tracing::info!(
            token.lifetime = token.expires_in().0,
            token.stale = stale_time.0,
            token.prefetch = prefetch_time.0,
            "machine credential refreshed"
        );

        let mut builder = RefreshResult::builder(token)
            .stale_time(stale_time)
            .prefetch_time(prefetch_time);
        if let Some(expiry) = expiry {
            builder = builder.expiry(expiry);
        }
        Ok(builder.build())
    }
}

/// Acquires and maintains an access token for a non-human principal
///
/// The provider holds one cached token and refreshes it transparently as
/// it ages, so [`get_bearer_token`][Self::get_bearer_token] normally costs
/// no more than a map lookup. It is reusable and safe to share across
/// tasks.
pub struct MachineCredentialProvider<C = System> {
    supplier: CachedResultSupplier<TokenResponse, C>,
    authn_method: TokenAuthnMethod,
}

impl<C: fmt::Debug> fmt::Debug for MachineCredentialProvider<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MachineCredentialProvider")
            .field("authn_method", &self.authn_method)
            .field("supplier", &self.supplier)
            .finish()
    }
}

impl MachineCredentialProvider<System> {
    /// Starts building a provider
    pub fn builder() -> MachineCredentialProviderBuilder<System> {
        MachineCredentialProviderBuilder {
            client_id: None,
            scope: DEFAULT_SCOPE.to_owned(),
            token_endpoint: None,
            authn_method: TokenAuthnMethod::ClientSecretPost,
            client_secret_env_var_name: None,
            client_assertion_provider: None,
            application_federated_credential_name: None,
            attested_document_provider: None,
            oidc_token_provider: None,
            client_x509_certificate: None,
            x509_cert_chains: None,
            async_credential_update: false,
            stale_value_behavior: StaleValueBehavior::Strict,
            http_client: None,
            jitter: None,
            clock: System,
        }
    }

    /// Builds a provider from a validated [`ClientConfig`], wiring up the
    /// material providers the configured method calls for
    pub fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let authn = config.authn.as_ref().ok_or_else(|| {
            Error::config(
                codes::AUTHN_CONFIGURATION_NOT_FOUND,
                "authentication configuration is missing",
            )
        })?;

        let client = http::shared_client(&config.http)?;

        let mut builder = Self::builder()
            .client_id(config.client_id.clone())
            .scope(config.scope.clone())
            .token_endpoint(config.token_endpoint.clone())
            .authn_method(authn.authn_method)
            .http_client(client.clone());

        if let Some(name) = &authn.client_secret_env_var_name {
            builder = builder.client_secret_env_var_name(name.clone());
        }
        if let Some(name) = &authn.application_federated_credential_name {
            builder = builder.application_federated_credential_name(name.clone());
        }

        match authn.authn_method {
            TokenAuthnMethod::ClientSecretBasic | TokenAuthnMethod::ClientSecretPost => {}
            TokenAuthnMethod::ClientSecretJwt => {
                let env_var = authn
                    .client_secret_env_var_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CLIENT_SECRET_ENV_VAR.to_owned());
                builder =
                    builder.client_assertion_provider(EnvClientSecretAssertionProvider::new(env_var));
            }
            TokenAuthnMethod::PrivateKeyJwt | TokenAuthnMethod::Pca => {
                let env_var = authn.private_key_env_var_name.clone().ok_or_else(|| {
                    Error::config(
                        codes::PRIVATE_KEY_ENV_VAR_NAME_NOT_FOUND,
                        "privateKeyEnvVarName is required",
                    )
                })?;
                builder =
                    builder.client_assertion_provider(EnvPrivateKeyAssertionProvider::new(env_var));
                if authn.authn_method == TokenAuthnMethod::Pca {
                    if let Some(cert) = &authn.client_x509_certificate {
                        builder = builder.client_x509_certificate(cert.clone());
                    }
                    if let Some(chains) = &authn.x509_cert_chains {
                        builder = builder.x509_cert_chains(chains.clone());
                    }
                }
            }
            TokenAuthnMethod::Pkcs7 => {
                let instance_id = config.instance_id.clone().ok_or_else(|| {
                    Error::config(
                        codes::IDAAS_INSTANCE_ID_NOT_FOUND,
                        "idaasInstanceId is required for PKCS7",
                    )
                })?;
                builder = builder.attested_document_provider(
                    AlibabaCloudEcsAttestedDocumentProvider::new(instance_id, client)?,
                );
            }
            TokenAuthnMethod::Oidc => {
                let path = authn.oidc_token_file_path.clone().ok_or_else(|| {
                    Error::config(
                        codes::OIDC_TOKEN_FILE_PATH_NOT_FOUND,
                        "oidcTokenFilePath is required for OIDC",
                    )
                })?;
                builder = builder.oidc_token_provider(FileOidcTokenProvider::new(path));
            }
        }

        builder.build()
    }
}

impl<C: Clock + Send + Sync + 'static> MachineCredentialProvider<C> {
    /// Gets the current credential, refreshing it if required
    pub async fn get_credential(&self) -> Result<TokenResponse, Error> {
        self.supplier.get().await
    }

    /// Gets the current bearer token, refreshing the credential if required
    pub async fn get_bearer_token(&self) -> Result<AccessToken, Error> {
        Ok(self.get_credential().await?.access_token().to_owned())
    }

    /// The authentication method this provider uses
    pub fn authn_method(&self) -> TokenAuthnMethod {
        self.authn_method
    }
}

/// Builder for [`MachineCredentialProvider`]
pub struct MachineCredentialProviderBuilder<C = System> {
    client_id: Option<ClientId>,
    scope: String,
    token_endpoint: Option<String>,
    authn_method: TokenAuthnMethod,
    client_secret_env_var_name: Option<String>,
    client_assertion_provider: Option<Arc<dyn ClientAssertionProvider>>,
    application_federated_credential_name: Option<String>,
    attested_document_provider: Option<Arc<dyn Pkcs7AttestedDocumentProvider>>,
    oidc_token_provider: Option<Arc<dyn OidcTokenProvider>>,
    client_x509_certificate: Option<String>,
    x509_cert_chains: Option<String>,
    async_credential_update: bool,
    stale_value_behavior: StaleValueBehavior,
    http_client: Option<reqwest::Client>,
    jitter: Option<Box<dyn JitterSource>>,
    clock: C,
}

impl<C: fmt::Debug> fmt::Debug for MachineCredentialProviderBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MachineCredentialProviderBuilder")
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .field("token_endpoint", &self.token_endpoint)
            .field("authn_method", &self.authn_method)
            .field("async_credential_update", &self.async_credential_update)
            .field("stale_value_behavior", &self.stale_value_behavior)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<C> MachineCredentialProviderBuilder<C> {
    /// Sets the OAuth2 client ID
    pub fn client_id(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the OAuth2 scope (defaults to the PAM credential scope)
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the token endpoint URL
    pub fn token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(token_endpoint.into());
        self
    }

    /// Sets the client authentication method (defaults to
    /// `CLIENT_SECRET_POST`)
    pub fn authn_method(mut self, authn_method: TokenAuthnMethod) -> Self {
        self.authn_method = authn_method;
        self
    }

    /// Sets the environment variable consulted for the client secret
    pub fn client_secret_env_var_name(mut self, name: impl Into<String>) -> Self {
        self.client_secret_env_var_name = Some(name.into());
        self
    }

    /// Sets the client assertion provider used by the JWT methods
    pub fn client_assertion_provider(
        mut self,
        provider: impl ClientAssertionProvider + 'static,
    ) -> Self {
        self.client_assertion_provider = Some(Arc::new(provider));
        self
    }

    /// Sets the federated credential name used by the federated methods
    pub fn application_federated_credential_name(mut self, name: impl Into<String>) -> Self {
        self.application_federated_credential_name = Some(name.into());
        self
    }

    /// Sets the attested document provider used by the PKCS7 method
    pub fn attested_document_provider(
        mut self,
        provider: impl Pkcs7AttestedDocumentProvider + 'static,
    ) -> Self {
        self.attested_document_provider = Some(Arc::new(provider));
        self
    }

    /// Sets the OIDC token provider used by the OIDC method
    pub fn oidc_token_provider(mut self, provider: impl OidcTokenProvider + 'static) -> Self {
        self.oidc_token_provider = Some(Arc::new(provider));
        self
    }

    /// Sets the client X.509 certificate used by the PCA method
    pub fn client_x509_certificate(mut self, certificate: impl Into<String>) -> Self {
        self.client_x509_certificate = Some(certificate.into());
        self
    }

    /// Sets the X.509 certificate chain used by the PCA method
    pub fn x509_cert_chains(mut self, chains: impl Into<String>) -> Self {
        self.x509_cert_chains = Some(chains.into());
        self
    }

    /// When enabled, prefetch refreshes run on the shared background worker
    /// instead of on a caller's stack
    pub fn async_credential_update(mut self, enabled: bool) -> Self {
        self.async_credential_update = enabled;
        self
    }

    /// Sets the stale-value behavior (defaults to `STRICT`)
    pub fn stale_value_behavior(mut self, behavior: StaleValueBehavior) -> Self {
        self.stale_value_behavior = behavior;
        self
    }

    /// Sets the HTTP client used for token requests
    ///
    /// Defaults to the process-wide shared client.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the jitter source applied to refreshed lifecycle points
    pub fn jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.jitter = Some(Box::new(jitter));
        self
    }

    /// Sets a custom clock
    ///
    /// Useful for testing purposes
    pub fn clock<D: Clock>(self, clock: D) -> MachineCredentialProviderBuilder<D> {
        MachineCredentialProviderBuilder {
            client_id: self.client_id,
            scope: self.scope,
            token_endpoint: self.token_endpoint,
            authn_method: self.authn_method,
            client_secret_env_var_name: self.client_secret_env_var_name,
            client_assertion_provider: self.client_assertion_provider,
            application_federated_credential_name: self.application_federated_credential_name,
            attested_document_provider: self.attested_document_provider,
            oidc_token_provider: self.oidc_token_provider,
            client_x509_certificate: self.client_x509_certificate,
            x509_cert_chains: self.x509_cert_chains,
            async_credential_update: self.async_credential_update,
            stale_value_behavior: self.stale_value_behavior,
            http_client: self.http_client,
            jitter: self.jitter,
            clock,
        }
    }
}

impl<C: Clock + Clone + Send + Sync + 'static> MachineCredentialProviderBuilder<C> {
    /// Builds the provider
    pub fn build(self) -> Result<MachineCredentialProvider<C>, Error> {
        let client_id = self
            .client_id
            .filter(|id| !id.as_str().trim().is_empty())
            .ok_or_else(|| Error::config(codes::CLIENT_ID_NOT_FOUND, "clientId is blank"))?;
        let token_endpoint = self
            .token_endpoint
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                Error::config(codes::TOKEN_ENDPOINT_NOT_FOUND, "tokenEndpoint is blank")
            })?;
        if self.scope.trim().is_empty() {
            return Err(Error::config(codes::SCOPE_NOT_FOUND, "scope is blank"));
        }

        let http = match self.http_client {
            Some(client) => client,
            None => http::shared_client(&crate::config::HttpConfiguration::default())?,
        };

        let authn_method = self.authn_method;
        let core = Arc::new(ProviderCore {
            client_id,
            scope: self.scope,
            token_endpoint,
            authn_method,
            client_secret_env_var_name: self
                .client_secret_env_var_name
                .unwrap_or_else(|| DEFAULT_CLIENT_SECRET_ENV_VAR.to_owned()),
            client_assertion_provider: self.client_assertion_provider,
            application_federated_credential_name: self.application_federated_credential_name,
            attested_document_provider: self.attested_document_provider,
            oidc_token_provider: self.oidc_token_provider,
            client_x509_certificate: self.client_x509_certificate,
            x509_cert_chains: self.x509_cert_chains,
            http,
            clock: self.clock.clone(),
        });

        let mut supplier = CachedResultSupplier::builder(move || {
            let core = Arc::clone(&core);
            async move { core.refresh_credential().await }
        })
        .stale_value_behavior(self.stale_value_behavior);

        supplier = if self.async_credential_update {
            supplier.prefetch_strategy(NonBlockingPrefetchStrategy::new())
        } else {
            supplier.prefetch_strategy(OneCallerBlocksPrefetchStrategy::new())
        };
        if let Some(jitter) = self.jitter {
            supplier = supplier.jitter(jitter);
        }

        Ok(MachineCredentialProvider {
            supplier: supplier.clock(self.clock).build(),
            authn_method,
        })
    }
}

#[cfg(test)]
mod tests {
    use aliri_clock::{DurationSecs, TestClock, UnixTime};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{jitter::NullJitter, provider::StaticPrivateKeyAssertionProvider};

    const T0: UnixTime = UnixTime(1_700_000_000);

    fn token_body(token: &str, expires_in: u64) -> serde_json::Value {
        json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": expires_in,
        })
    }

    fn secret_post_provider(
        server: &MockServer,
        clock: &TestClock,
        behavior: StaleValueBehavior,
        secret_env: &str,
    ) -> MachineCredentialProvider<TestClock> {
        MachineCredentialProvider::builder()
            .client_id("abc")
            .scope("pam")
            .token_endpoint(format!("{}/token", server.uri()))
            .authn_method(TokenAuthnMethod::ClientSecretPost)
            .client_secret_env_var_name(secret_env)
            .stale_value_behavior(behavior)
            .jitter(NullJitter)
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    fn urldecode(value: &str) -> String {
        let mut out = Vec::new();
        let bytes = value.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'%' if i + 2 < bytes.len() => {
                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                    out.push(u8::from_str_radix(hex, 16).unwrap());
                    i += 3;
                }
                b'+' => {
                    out.push(b' ');
                    i += 1;
                }
                b => {
                    out.push(b);
                    i += 1;
                }
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn client_secret_post_happy_path() {
        std::env::set_var("DEMO_SECRET", "sekrit");
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(header("accept", "application/json"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=abc"))
            .and(body_string_contains("client_secret=sekrit"))
            .and(body_string_contains("scope=pam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            secret_post_provider(&server, &clock, StaleValueBehavior::Strict, "DEMO_SECRET");

        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        // a second read within the fresh window issues no new request
        clock.advance(DurationSecs(1));
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        server.verify().await;
    }

    #[tokio::test]
    async fn prefetch_window_refreshes_synchronously_under_one_caller_blocks() {
        std::env::set_var("PREFETCH_SECRET", "sekrit");
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 3600)))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            secret_post_provider(&server, &clock, StaleValueBehavior::Strict, "PREFETCH_SECRET");
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        // one second into the prefetch window: the read still yields T1,
        // and exactly one refresh request goes out on the caller's stack
        clock.set(T0 + DurationSecs(3600) - DurationSecs(1200) + DurationSecs(1));
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        // the refreshed token is what subsequent reads observe
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T2");

        server.verify().await;
    }

    #[tokio::test]
    async fn stale_reads_block_on_the_refresh() {
        std::env::set_var("STALE_SECRET", "sekrit");
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 3600)))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let provider =
            secret_post_provider(&server, &clock, StaleValueBehavior::Strict, "STALE_SECRET");
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", 3600)))
            .mount(&server)
            .await;

        clock.set(T0 + DurationSecs(3600) - DurationSecs(720) + DurationSecs(1));
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T2");
    }

    #[tokio::test]
    async fn allow_serves_the_previous_token_through_refresh_failures() {
        std::env::set_var("ALLOW_SECRET", "sekrit");
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 3600)))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let provider =
            secret_post_provider(&server, &clock, StaleValueBehavior::Allow, "ALLOW_SECRET");
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .mount(&server)
            .await;

        // refresh fails inside the prefetch window: the fresh token is served
        clock.set(T0 + DurationSecs(3600) - DurationSecs(1200) + DurationSecs(1));
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        // refresh keeps failing past the stale point: the prior token survives
        clock.set(T0 + DurationSecs(3600) - DurationSecs(720) + DurationSecs(1));
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");
    }

    #[tokio::test]
    async fn one_second_tokens_refresh_on_the_next_read() {
        std::env::set_var("SHORT_SECRET", "sekrit");
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 1)))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let provider =
            secret_post_provider(&server, &clock, StaleValueBehavior::Strict, "SHORT_SECRET");
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        // the entry was immediately stale-ish, so the next read refreshes
        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T2");
        server.verify().await;
    }

    #[tokio::test]
    async fn private_key_jwt_assembles_a_verifiable_assertion() {
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        let generated = jsonwebkey::Key::generate_p256();
        let private_pem = generated.to_pem();
        let public_pem = generated.to_public().unwrap().to_pem();

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(
                "client_assertion_type=urn%3Aietf%3Aparams%3Aoauth%3Aclient-assertion-type%3Ajwt-bearer",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/token", server.uri());
        let provider = MachineCredentialProvider::builder()
            .client_id("abc")
            .scope("pam")
            .token_endpoint(endpoint.clone())
            .authn_method(TokenAuthnMethod::PrivateKeyJwt)
            .client_assertion_provider(
                StaticPrivateKeyAssertionProvider::from_pem(&private_pem)
                    .unwrap()
                    .with_clock(clock.clone()),
            )
            .jitter(NullJitter)
            .clock(clock.clone())
            .build()
            .unwrap();

        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");

        // pull the assertion back out of the captured request and verify it
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        let assertion = body
            .split('&')
            .find_map(|pair| pair.strip_prefix("client_assertion="))
            .map(urldecode)
            .unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
        validation.set_audience(&[endpoint.as_str()]);
        validation.validate_exp = false;

        #[derive(serde::Deserialize)]
        struct Claims {
            iss: String,
            sub: String,
            iat: u64,
            exp: u64,
        }

        let decoded = jsonwebtoken::decode::<Claims>(
            &assertion,
            &jsonwebtoken::DecodingKey::from_ec_pem(public_pem.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.header.alg, jsonwebtoken::Algorithm::ES256);
        assert_eq!(decoded.claims.iss, "abc");
        assert_eq!(decoded.claims.sub, "abc");
        assert_eq!(decoded.claims.iat, T0.0);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 300);
    }

    #[tokio::test]
    async fn oidc_method_posts_the_federated_token() {
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "header.claims.signature").unwrap();

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("application_federated_credential_name=fed-1"))
            .and(body_string_contains("client_assertion=header.claims.signature"))
            .and(body_string_contains(
                "client_assertion_type=urn%3Acloud%3Aidaas%3Aparams%3Aoauth%3Aclient-assertion-type%3Aid-token-bearer",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let provider = MachineCredentialProvider::builder()
            .client_id("abc")
            .scope("pam")
            .token_endpoint(format!("{}/token", server.uri()))
            .authn_method(TokenAuthnMethod::Oidc)
            .application_federated_credential_name("fed-1")
            .oidc_token_provider(FileOidcTokenProvider::new(file.path()))
            .jitter(NullJitter)
            .clock(clock.clone())
            .build()
            .unwrap();

        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");
        server.verify().await;
    }

    #[tokio::test]
    async fn unauthorized_responses_map_to_a_client_error() {
        std::env::set_var("MAPPING_SECRET", "sekrit");
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("x-request-id", "r-42")
                    .set_body_json(json!({
                        "error": "invalid_client",
                        "error_description": "bad secret",
                    })),
            )
            .mount(&server)
            .await;

        let provider =
            secret_post_provider(&server, &clock, StaleValueBehavior::Strict, "MAPPING_SECRET");

        let err = provider.get_credential().await.unwrap_err();
        match err.root_cause() {
            Error::Client {
                error_code,
                error_description,
                request_id,
            } => {
                assert_eq!(error_code, "invalid_client");
                assert!(error_description.as_deref().unwrap().contains("bad secret"));
                assert_eq!(request_id.as_deref(), Some("r-42"));
            }
            other => panic!("expected a client error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_secret_surfaces_a_credential_error() {
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        let provider = secret_post_provider(
            &server,
            &clock,
            StaleValueBehavior::Strict,
            "DEFINITELY_UNSET_SECRET_VAR",
        );

        let err = provider.get_credential().await.unwrap_err();
        assert_eq!(err.root_cause().code(), codes::CLIENT_SECRET_NOT_FOUND);
    }

    #[tokio::test]
    async fn basic_method_moves_credentials_to_the_authorization_header() {
        std::env::set_var("BASIC_SECRET", "sekrit");
        let server = MockServer::start().await;
        let clock = TestClock::new(T0);

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(header("authorization", "Basic YWJjOnNla3JpdA=="))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let provider = MachineCredentialProvider::builder()
            .client_id("abc")
            .scope("pam")
            .token_endpoint(format!("{}/token", server.uri()))
            .authn_method(TokenAuthnMethod::ClientSecretBasic)
            .client_secret_env_var_name("BASIC_SECRET")
            .jitter(NullJitter)
            .clock(clock.clone())
            .build()
            .unwrap();

        assert_eq!(provider.get_bearer_token().await.unwrap().as_str(), "T1");
        server.verify().await;
    }

    #[tokio::test]
    async fn token_exchange_round_trips_through_the_endpoint() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(
                "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange",
            ))
            .and(body_string_contains("audience=aud-1"))
            .and(body_string_contains("subject_token=h.c.s"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("EX1", 600)))
            .expect(1)
            .mount(&server)
            .await;

        let response = oauth2::token_exchange(
            &reqwest::Client::new(),
            &format!("{}/token", server.uri()),
            &oauth2::TokenExchangeRequest {
                audience: "aud-1".to_owned(),
                subject_token: "h.c.s".to_owned(),
                scope: "pam".to_owned(),
            },
        )
        .await
        .unwrap();

        assert_eq!(response.access_token().as_str(), "EX1");
        server.verify().await;
    }
}
