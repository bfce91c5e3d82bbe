//! PKCS7 attested document providers
//!
//! The Alibaba Cloud ECS provider fetches its document from the instance
//! metadata service using session-token semantics: a short-lived session
//! token is acquired with a PUT, then presented on the document GET, with
//! one retry when the metadata service rejects a session token that has
//! just lapsed.

use std::sync::Arc;

use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use async_trait::async_trait;

use super::Pkcs7AttestedDocumentProvider;
use crate::{
    cache::{CachedResultSupplier, RefreshResult, StaleValueBehavior},
    error::{codes, Error},
    oauth2::map_transport_error,
    Pkcs7Document,
};

/// The Alibaba Cloud ECS metadata service
pub const ECS_METADATA_BASE_URL: &str = "http://100.100.100.200";

const METADATA_TOKEN_PATH: &str = "/latest/api/token";
const METADATA_PKCS7_PATH: &str = "/latest/dynamic/instance-identity/pkcs7";
const METADATA_TOKEN_TTL_HEADER: &str = "X-aliyun-ecs-metadata-token-ttl-seconds";
const METADATA_TOKEN_HEADER: &str = "X-aliyun-ecs-metadata-token";

const MIN_DOCUMENT_EFFECTIVE_SECS: u64 = 1_200;
const MAX_DOCUMENT_EFFECTIVE_SECS: u64 = 1_314_000;

/// Serves a fixed attested document
#[derive(Debug)]
pub struct StaticPkcs7AttestedDocumentProvider {
    document: Pkcs7Document,
}

impl StaticPkcs7AttestedDocumentProvider {
    /// Constructs a provider serving `document`
    pub fn new(document: Pkcs7Document) -> Self {
        Self { document }
    }
}

#[async_trait]
impl Pkcs7AttestedDocumentProvider for StaticPkcs7AttestedDocumentProvider {
    async fn attested_document(&self) -> Result<Pkcs7Document, Error> {
        Ok(self.document.clone())
    }
}

/// Attested documents from AWS EC2
///
/// Not implemented; every call fails with a `NotImplemented` error.
#[derive(Clone, Copy, Debug, Default)]
pub struct AwsEc2Pkcs7AttestedDocumentProvider;

#[async_trait]
impl Pkcs7AttestedDocumentProvider for AwsEc2Pkcs7AttestedDocumentProvider {
    async fn attested_document(&self) -> Result<Pkcs7Document, Error> {
        Err(Error::credential(
            codes::NOT_IMPLEMENTED,
            "the AWS EC2 PKCS7 attested document provider is not implemented",
        ))
    }
}

struct EcsDocumentFetcher<C> {
    client: reqwest::Client,
    token_url: String,
    document_url: String,
    instance_id: String,
    document_effective: DurationSecs,
    clock: C,
}

impl<C: Clock> EcsDocumentFetcher<C> {
    async fn metadata_session_token(&self) -> Result<String, Error> {
        let response = self
            .client
            .put(&self.token_url)
            .header(
                METADATA_TOKEN_TTL_HEADER,
                self.document_effective.0.to_string(),
            )
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = metadata_error_for_status(response).await?;
        response.text().await.map_err(map_transport_error)
    }

    async fn fetch_document(
        &self,
        session_token: &str,
        signing_time: UnixTime,
    ) -> Result<reqwest::Response, Error> {
        let audience = serde_json::json!({
            "aud": self.instance_id,
            "signingTime": signing_time.0,
        });

        self.client
            .get(&self.document_url)
            .query(&[("audience", audience.to_string())])
            .header(METADATA_TOKEN_HEADER, session_token)
            .send()
            .await
            .map_err(map_transport_error)
    }

    #[tracing::instrument(skip(self), fields(instance_id = %self.instance_id))]
    async fn refresh(&self) -> Result<RefreshResult<Pkcs7Document>, Error> {
        let signing_time = self.clock.now();

        let session_token = self.metadata_session_token().await?;
        let mut response = self.fetch_document(&session_token, signing_time).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::debug!("metadata session token rejected; acquiring a fresh one");
            let session_token = self.metadata_session_token().await?;
            response = self.fetch_document(&session_token, signing_time).await?;
        }

        let response = metadata_error_for_status(response).await?;
        let document = response.text().await.map_err(map_transport_error)?;

        let expiry = signing_time + self.document_effective;
        Ok(RefreshResult::builder(Pkcs7Document::from(document))
            .stale_time(expiry - self.document_effective / 5)
            .prefetch_time(expiry - self.document_effective / 3)
            .expiry(expiry)
            .build())
    }
}

async fn metadata_error_for_status(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let error_description = if body.trim().is_empty() { None } else { Some(body) };
    if status.is_server_error() {
        Err(Error::Server {
            error_code: status.as_u16().to_string(),
            error_description,
            request_id: None,
        })
    } else {
        Err(Error::Client {
            error_code: status.as_u16().to_string(),
            error_description,
            request_id: None,
        })
    }
}

/// Attested documents from the Alibaba Cloud ECS metadata service
///
/// The document is valid for `document_effective_secs` (an hour by
/// default) and is cached behind its own [`CachedResultSupplier`], so
/// repeated reads hit the metadata service only as the document ages.
#[derive(Debug)]
pub struct AlibabaCloudEcsAttestedDocumentProvider<C = System> {
    supplier: CachedResultSupplier<Pkcs7Document, C>,
}

impl AlibabaCloudEcsAttestedDocumentProvider {
    /// Constructs a provider for the given IDaaS instance using the real
    /// metadata service and a one hour document lifetime
    pub fn new(instance_id: impl Into<String>, client: reqwest::Client) -> Result<Self, Error> {
        Self::with_options(
            instance_id,
            client,
            ECS_METADATA_BASE_URL,
            3_600,
            StaleValueBehavior::Strict,
            System,
        )
    }
}

impl<C: Clock + Clone + Send + Sync + 'static> AlibabaCloudEcsAttestedDocumentProvider<C> {
    /// Constructs a provider with full control over the metadata endpoint,
    /// document lifetime, refresh-failure policy, and clock
    pub fn with_options(
        instance_id: impl Into<String>,
        client: reqwest::Client,
        metadata_base_url: &str,
        document_effective_secs: u64,
        stale_value_behavior: StaleValueBehavior,
        clock: C,
    ) -> Result<Self, Error> {
        let instance_id = instance_id.into();
        if instance_id.trim().is_empty() {
            return Err(Error::config(
                codes::IDAAS_INSTANCE_ID_NOT_FOUND,
                "idaasInstanceId is blank",
            ));
        }
        if document_effective_secs <= MIN_DOCUMENT_EFFECTIVE_SECS
            || document_effective_secs > MAX_DOCUMENT_EFFECTIVE_SECS
        {
            return Err(Error::config(
                codes::DOCUMENT_EFFECTIVE_SECONDS_NOT_VALID,
                format!(
                    "documentEffectiveSeconds must be greater than \
                     {MIN_DOCUMENT_EFFECTIVE_SECS} and at most {MAX_DOCUMENT_EFFECTIVE_SECS}, \
                     got {document_effective_secs}"
                ),
            ));
        }

        let base = metadata_base_url.trim_end_matches('/');
        let fetcher = Arc::new(EcsDocumentFetcher {
            client,
            token_url: format!("{base}{METADATA_TOKEN_PATH}"),
            document_url: format!("{base}{METADATA_PKCS7_PATH}"),
            instance_id,
            document_effective: DurationSecs(document_effective_secs),
            clock: clock.clone(),
        });

        let supplier = CachedResultSupplier::builder(move || {
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.refresh().await }
        })
        .stale_value_behavior(stale_value_behavior)
        .clock(clock)
        .build();

        Ok(Self { supplier })
    }
}

#[async_trait]
impl<C: Clock + Send + Sync + 'static> Pkcs7AttestedDocumentProvider
    for AlibabaCloudEcsAttestedDocumentProvider<C>
{
    async fn attested_document(&self) -> Result<Pkcs7Document, Error> {
        self.supplier.get().await
    }
}
