//! Token-endpoint request assembly and response mapping
//!
//! [`TokenRequest`] is a pure description of a `client_credentials` request:
//! given a client ID, scope, and method-specific material it produces the
//! ordered form pairs and (for HTTP Basic) the authorization header, without
//! touching the network. [`request_token`] sends the assembled request and
//! maps the HTTP outcome into the crate's error taxonomy.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;

use crate::{
    error::{codes, Error},
    ClientAssertion, ClientId, ClientSecret, OidcToken, Pkcs7Document, TokenResponse,
};

/// The `grant_type` used for machine credentials
pub const CLIENT_CREDENTIALS_GRANT_TYPE: &str = "client_credentials";

/// The `grant_type` used for token exchange (RFC 8693)
pub const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Client assertion type for JWT bearer assertions (RFC 7523)
pub const JWT_BEARER_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Client assertion type for PKCS7 attested documents
pub const PKCS7_BEARER_ASSERTION_TYPE: &str =
    "urn:cloud:idaas:params:oauth:client-assertion-type:pkcs7-bearer";

/// Client assertion type for federated OIDC tokens
pub const OIDC_BEARER_ASSERTION_TYPE: &str =
    "urn:cloud:idaas:params:oauth:client-assertion-type:id-token-bearer";

/// Client assertion type for private-CA bound JWT assertions
pub const X509_JWT_BEARER_ASSERTION_TYPE: &str =
    "urn:cloud:idaas:params:oauth:client-assertion-type:x509-jwt-bearer";

const SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
const REQUESTED_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Method-specific client authentication material
#[derive(Debug)]
pub enum ClientAuthentication {
    /// Client secret carried in the `Authorization: Basic` header
    SecretBasic {
        /// The client secret
        client_secret: ClientSecret,
    },
    /// Client secret posted in the form body
    SecretPost {
        /// The client secret
        client_secret: ClientSecret,
    },
    /// A signed JWT client assertion (RFC 7523)
    JwtAssertion {
        /// The signed assertion
        assertion: ClientAssertion,
    },
    /// A PKCS7-signed attested document for a federated credential
    Pkcs7 {
        /// The federated credential registered with the identity platform
        federated_credential_name: String,
        /// The attested document
        document: Pkcs7Document,
    },
    /// A federated OIDC token
    Oidc {
        /// The federated credential registered with the identity platform
        federated_credential_name: String,
        /// The OIDC token
        token: OidcToken,
    },
    /// A private-key assertion bound to an X.509 certificate chain
    PrivateCa {
        /// The federated credential registered with the identity platform
        federated_credential_name: String,
        /// The signed assertion
        assertion: ClientAssertion,
        /// The client certificate, PEM-encoded
        client_x509: String,
        /// The certificate chain, PEM-encoded
        client_x509_chain: String,
    },
}

/// A fully-described `client_credentials` token request
#[derive(Debug)]
pub struct TokenRequest {
    /// The OAuth2 client ID
    pub client_id: ClientId,
    /// The OAuth2 scope to request
    pub scope: String,
    /// The client authentication material
    pub authentication: ClientAuthentication,
}

impl TokenRequest {
    /// The ordered form pairs for the request body
    pub fn form_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![
            ("grant_type", CLIENT_CREDENTIALS_GRANT_TYPE),
            ("client_id", self.client_id.as_str()),
        ];

        match &self.authentication {
            ClientAuthentication::SecretBasic { .. } => {}
            ClientAuthentication::SecretPost { client_secret } => {
                pairs.push(("client_secret", client_secret.as_str()));
            }
            ClientAuthentication::JwtAssertion { assertion } => {
                pairs.push(("client_assertion_type", JWT_BEARER_ASSERTION_TYPE));
                pairs.push(("client_assertion", assertion.as_str()));
            }
            ClientAuthentication::Pkcs7 {
                federated_credential_name,
                document,
            } => {
                pairs.push((
                    "application_federated_credential_name",
                    federated_credential_name,
                ));
                pairs.push(("client_assertion_type", PKCS7_BEARER_ASSERTION_TYPE));
                pairs.push(("client_assertion", document.as_str()));
            }
            ClientAuthentication::Oidc {
                federated_credential_name,
                token,
            } => {
                pairs.push((
                    "application_federated_credential_name",
                    federated_credential_name,
                ));
                pairs.push(("client_assertion_type", OIDC_BEARER_ASSERTION_TYPE));
                pairs.push(("client_assertion", token.as_str()));
            }
            ClientAuthentication::PrivateCa {
                federated_credential_name,
                assertion,
                client_x509,
                client_x509_chain,
            } => {
                pairs.push((
                    "application_federated_credential_name",
                    federated_credential_name,
                ));
                pairs.push(("client_assertion_type", X509_JWT_BEARER_ASSERTION_TYPE));
                pairs.push(("client_assertion", assertion.as_str()));
                pairs.push(("client_x509", client_x509));
                pairs.push(("client_x509_chain", client_x509_chain));
            }
        }

        pairs.push(("scope", &self.scope));
        pairs
    }

    /// The `Authorization` header value, when the method calls for one
    pub fn basic_authorization(&self) -> Option<String> {
        match &self.authentication {
            ClientAuthentication::SecretBasic { client_secret } => {
                let credentials = format!("{}:{}", self.client_id.as_str(), client_secret.as_str());
                Some(format!("Basic {}", BASE64.encode(credentials)))
            }
            _ => None,
        }
    }
}

/// A token-exchange request (RFC 8693)
#[derive(Debug)]
pub struct TokenExchangeRequest {
    /// The audience of the requested token
    pub audience: String,
    /// The token being exchanged
    pub subject_token: String,
    /// The OAuth2 scope to request
    pub scope: String,
}

impl TokenExchangeRequest {
    /// The ordered form pairs for the request body
    pub fn form_pairs(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("grant_type", TOKEN_EXCHANGE_GRANT_TYPE),
            ("audience", &self.audience),
            ("subject_token", &self.subject_token),
            ("subject_token_type", SUBJECT_TOKEN_TYPE),
            ("requested_token_type", REQUESTED_TOKEN_TYPE),
            ("scope", &self.scope),
        ]
    }
}

/// Requests a token from the token endpoint
#[tracing::instrument(
    err,
    skip_all,
    fields(token_endpoint = %token_endpoint, client_id = %request.client_id),
)]
pub async fn request_token(
    client: &reqwest::Client,
    token_endpoint: &str,
    request: &TokenRequest,
) -> Result<TokenResponse, Error> {
    tracing::trace!("requesting token from the token endpoint");

    let mut builder = client
        .post(token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&request.form_pairs());

    if let Some(authorization) = request.basic_authorization() {
        builder = builder.header(reqwest::header::AUTHORIZATION, authorization);
    }

    let response = builder.send().await.map_err(map_transport_error)?;

    tracing::debug!(
        response.status = response.status().as_u16(),
        "received token response"
    );

    handle_token_response(response).await
}

/// Exchanges a subject token for an access token (RFC 8693)
#[tracing::instrument(
    err,
    skip_all,
    fields(token_endpoint = %token_endpoint, audience = %request.audience),
)]
pub async fn token_exchange(
    client: &reqwest::Client,
    token_endpoint: &str,
    request: &TokenExchangeRequest,
) -> Result<TokenResponse, Error> {
    let response = client
        .post(token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&request.form_pairs())
        .send()
        .await
        .map_err(map_transport_error)?;

    handle_token_response(response).await
}

pub(crate) fn map_transport_error(err: reqwest::Error) -> Error {
    let code = if err.is_timeout() {
        if err.is_connect() {
            codes::CONNECT_TIME_OUT
        } else {
            codes::READ_TIME_OUT
        }
    } else {
        codes::HTTP_REQUEST_FAILED
    };
    Error::Http {
        code,
        message: err.to_string(),
        source: Some(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrResponse {
    error: Option<String>,
    error_description: Option<String>,
    #[serde(alias = "requestId")]
    request_id: Option<String>,
}

async fn handle_token_response(response: reqwest::Response) -> Result<TokenResponse, Error> {
    let status = response.status();
    let header_request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    if status.is_success() {
        let body = response.bytes().await.map_err(map_transport_error)?;
        return serde_json::from_slice(&body).map_err(|err| {
            Error::encoding_with(
                codes::MALFORMED_TOKEN_RESPONSE,
                "unable to parse the token endpoint response body",
                err,
            )
        });
    }

    let body = response.text().await.unwrap_or_default();
    let parsed: ErrResponse = serde_json::from_str(&body).unwrap_or_default();

    let error_code = parsed
        .error
        .unwrap_or_else(|| status.as_u16().to_string());
    let error_description = parsed.error_description.or_else(|| {
        if body.trim().is_empty() {
            None
        } else {
            Some(body)
        }
    });
    let request_id = header_request_id.or(parsed.request_id);

    if status.is_server_error() {
        Err(Error::Server {
            error_code,
            error_description,
            request_id,
        })
    } else {
        Err(Error::Client {
            error_code,
            error_description,
            request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs_to_map(pairs: &[(&'static str, &str)]) -> std::collections::HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn secret_post_carries_the_secret_in_the_body() {
        let request = TokenRequest {
            client_id: ClientId::from_static("abc"),
            scope: "pam".to_owned(),
            authentication: ClientAuthentication::SecretPost {
                client_secret: ClientSecret::from_static("sekrit"),
            },
        };

        let pairs = pairs_to_map(&request.form_pairs());
        assert_eq!(pairs["grant_type"], "client_credentials");
        assert_eq!(pairs["client_id"], "abc");
        assert_eq!(pairs["client_secret"], "sekrit");
        assert_eq!(pairs["scope"], "pam");
        assert!(request.basic_authorization().is_none());
    }

    #[test]
    fn secret_basic_moves_the_secret_to_the_header() {
        let request = TokenRequest {
            client_id: ClientId::from_static("abc"),
            scope: "pam".to_owned(),
            authentication: ClientAuthentication::SecretBasic {
                client_secret: ClientSecret::from_static("sekrit"),
            },
        };

        let pairs = pairs_to_map(&request.form_pairs());
        assert!(!pairs.contains_key("client_secret"));
        assert_eq!(
            request.basic_authorization().as_deref(),
            Some("Basic YWJjOnNla3JpdA==")
        );
    }

    #[test]
    fn jwt_assertion_uses_the_rfc_assertion_type() {
        let request = TokenRequest {
            client_id: ClientId::from_static("abc"),
            scope: "pam".to_owned(),
            authentication: ClientAuthentication::JwtAssertion {
                assertion: ClientAssertion::from_static("h.c.s"),
            },
        };

        let pairs = pairs_to_map(&request.form_pairs());
        assert_eq!(
            pairs["client_assertion_type"],
            "urn:ietf:params:oauth:client-assertion-type:jwt-bearer"
        );
        assert_eq!(pairs["client_assertion"], "h.c.s");
    }

    #[test]
    fn federated_methods_carry_the_credential_name() {
        let request = TokenRequest {
            client_id: ClientId::from_static("abc"),
            scope: "pam".to_owned(),
            authentication: ClientAuthentication::Oidc {
                federated_credential_name: "fed-1".to_owned(),
                token: OidcToken::from_static("h.c.s"),
            },
        };

        let pairs = pairs_to_map(&request.form_pairs());
        assert_eq!(pairs["application_federated_credential_name"], "fed-1");
        assert_eq!(pairs["client_assertion_type"], OIDC_BEARER_ASSERTION_TYPE);
    }

    #[test]
    fn private_ca_includes_the_certificate_chain() {
        let request = TokenRequest {
            client_id: ClientId::from_static("abc"),
            scope: "pam".to_owned(),
            authentication: ClientAuthentication::PrivateCa {
                federated_credential_name: "fed-1".to_owned(),
                assertion: ClientAssertion::from_static("h.c.s"),
                client_x509: "CERT".to_owned(),
                client_x509_chain: "CHAIN".to_owned(),
            },
        };

        let pairs = pairs_to_map(&request.form_pairs());
        assert_eq!(pairs["client_assertion_type"], X509_JWT_BEARER_ASSERTION_TYPE);
        assert_eq!(pairs["client_x509"], "CERT");
        assert_eq!(pairs["client_x509_chain"], "CHAIN");
    }

    #[test]
    fn token_exchange_pairs_follow_rfc_8693() {
        let request = TokenExchangeRequest {
            audience: "aud".to_owned(),
            subject_token: "h.c.s".to_owned(),
            scope: "pam".to_owned(),
        };

        let pairs = pairs_to_map(&request.form_pairs());
        assert_eq!(pairs["grant_type"], TOKEN_EXCHANGE_GRANT_TYPE);
        assert_eq!(pairs["subject_token_type"], SUBJECT_TOKEN_TYPE);
        assert_eq!(pairs["requested_token_type"], REQUESTED_TOKEN_TYPE);
    }
}
