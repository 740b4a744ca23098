//! HTTP provider plugins.
//!
//! A plugin is an out-of-process server speaking a small JSON protocol:
//!
//! - `GET /v1/schema` lists the resource types it serves
//! - `POST /v1/resources/{type}` creates an object
//! - `GET|PUT|DELETE /v1/resources/{type}/{id}` reads, updates, deletes
//! - `GET /v1/resources/{type}?token=...` finds an object by idempotency token
//!
//! Every mutating request carries the operation's `Idempotency-Key`, so a
//! retried request never creates a second object.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ProviderConfig;
use crate::error::{ConfigError, HalldyllError, ProviderError, Result};

use super::registry::ProviderRegistry;
use super::traits::{
    Attributes, OperationContext, Provider, ProviderResult, RemoteObject, ResourceSchema,
};

/// Header carrying the operation's idempotency token.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Header carrying the resource address, for plugin-side logging.
const ADDRESS_HEADER: &str = "X-Resource-Address";

/// Schema listing returned by `GET /v1/schema`.
#[derive(Debug, Serialize, Deserialize)]
struct SchemaResponse {
    resource_types: Vec<ResourceSchema>,
}

/// Body of create and update requests.
#[derive(Debug, Serialize)]
struct AttributesRequest<'a> {
    attributes: &'a Attributes,
}

/// HTTP client for one provider plugin.
#[derive(Debug, Clone)]
pub struct PluginClient {
    /// Provider name from the configuration.
    name: String,
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token, if configured.
    token: Option<String>,
}

impl PluginClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        name: impl Into<String>,
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Creates a client from a provider declaration, reading the token from
    /// the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the token variable is unset or the client cannot be built.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let token = match config.token_env.as_deref().filter(|v| !v.is_empty()) {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                HalldyllError::Config(ConfigError::MissingEnvVar {
                    name: var.to_string(),
                })
            })?),
            None => None,
        };

        Self::new(
            config.name.clone(),
            &config.endpoint,
            token,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Fetches the schemas of every type the plugin serves.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin is unreachable or answers with garbage.
    pub async fn fetch_schemas(&self) -> ProviderResult<Vec<ResourceSchema>> {
        let url = format!("{}/v1/schema", self.endpoint);
        let response = self.send(self.client.get(&url), None).await?;
        let response = Self::check(response, "schema").await?;
        let listing: SchemaResponse = Self::decode(response).await?;
        debug!(
            "Plugin {} serves {} resource types",
            self.name,
            listing.resource_types.len()
        );
        Ok(listing.resource_types)
    }

    /// Connects to the plugin and returns one provider per served type.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema listing cannot be fetched.
    pub async fn into_providers(self) -> ProviderResult<Vec<HttpProvider>> {
        let schemas = self.fetch_schemas().await?;
        let client = Arc::new(self);
        Ok(schemas
            .into_iter()
            .map(|schema| HttpProvider {
                client: Arc::clone(&client),
                schema,
            })
            .collect())
    }

    fn resource_url(&self, resource_type: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/v1/resources/{resource_type}/{id}", self.endpoint),
            None => format!("{}/v1/resources/{resource_type}", self.endpoint),
        }
    }

    /// Adds common headers and sends the request.
    async fn send(
        &self,
        request: RequestBuilder,
        ctx: Option<&OperationContext>,
    ) -> ProviderResult<Response> {
        let mut request = request.header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(ctx) = ctx {
            trace!("{} request for {} (token {})", self.name, ctx.address, ctx.token);
            request = request
                .header(IDEMPOTENCY_HEADER, &ctx.token)
                .header(ADDRESS_HEADER, &ctx.address);
        }

        request.send().await.map_err(map_transport_error)
    }

    /// Turns non-success statuses into provider errors.
    async fn check(response: Response, subject: &str) -> ProviderResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, subject, &body))
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::protocol(format!("Failed to parse response: {e}")))
    }
}

/// Maps an HTTP status to a provider error.
///
/// 404 maps to `NotFound`; 408/504 to `Timeout`; 429 to `RateLimited`;
/// 500/502/503 to `Unavailable`; 400/422 to `Validation`; 401/403 to
/// `PermissionDenied`; 409 to `Conflict`. Anything else is a protocol error.
#[must_use]
pub fn classify_status(
    status: StatusCode,
    retry_after_secs: Option<u64>,
    subject: &str,
    body: &str,
) -> ProviderError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };

    match status.as_u16() {
        404 => ProviderError::NotFound {
            id: subject.to_string(),
        },
        408 | 504 => ProviderError::Timeout { message },
        429 => ProviderError::RateLimited {
            retry_after_secs,
            message,
        },
        500 | 502 | 503 => ProviderError::Unavailable { message },
        400 | 422 => ProviderError::Validation { message },
        401 | 403 => ProviderError::PermissionDenied { message },
        409 => ProviderError::Conflict { message },
        _ => ProviderError::Protocol { message },
    }
}

/// Maps transport failures.
///
/// A request that timed out or broke mid-exchange may have reached the
/// plugin; a refused connection never did.
fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_connect() || e.is_builder() {
        ProviderError::unreachable(format!("Could not reach plugin: {e}"))
    } else if e.is_timeout() {
        ProviderError::Timeout {
            message: format!("Request timed out: {e}"),
        }
    } else if e.is_decode() {
        ProviderError::protocol(format!("Failed to decode response: {e}"))
    } else {
        ProviderError::unavailable(format!("Request failed: {e}"))
    }
}

/// Provider for one resource type served by an HTTP plugin.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// Shared plugin client.
    client: Arc<PluginClient>,
    /// Schema of the served type.
    schema: ResourceSchema,
}

impl HttpProvider {
    fn url(&self, id: Option<&str>) -> String {
        self.client.resource_url(&self.schema.resource_type, id)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteObject> {
        let request = self
            .client
            .client
            .post(self.url(None))
            .json(&AttributesRequest { attributes });
        let response = self.client.send(request, Some(ctx)).await?;
        let response = PluginClient::check(response, &ctx.address).await?;
        PluginClient::decode(response).await
    }

    async fn read(&self, ctx: &OperationContext, id: &str) -> ProviderResult<Option<Attributes>> {
        let request = self.client.client.get(self.url(Some(id)));
        let response = self.client.send(request, Some(ctx)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = PluginClient::check(response, id).await?;
        let object: RemoteObject = PluginClient::decode(response).await?;
        Ok(Some(object.attributes))
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        let request = self
            .client
            .client
            .put(self.url(Some(id)))
            .json(&AttributesRequest { attributes });
        let response = self.client.send(request, Some(ctx)).await?;
        let response = PluginClient::check(response, id).await?;
        let object: RemoteObject = PluginClient::decode(response).await?;
        Ok(object.attributes)
    }

    async fn delete(&self, ctx: &OperationContext, id: &str) -> ProviderResult<()> {
        let request = self.client.client.delete(self.url(Some(id)));
        let response = self.client.send(request, Some(ctx)).await?;
        PluginClient::check(response, id).await?;
        Ok(())
    }

    async fn find(&self, ctx: &OperationContext) -> ProviderResult<Option<RemoteObject>> {
        let request = self
            .client
            .client
            .get(self.url(None))
            .query(&[("token", ctx.token.as_str())]);
        let response = self.client.send(request, Some(ctx)).await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                Ok(None)
            }
            _ => {
                let response = PluginClient::check(response, &ctx.address).await?;
                PluginClient::decode(response).await.map(Some)
            }
        }
    }
}

/// Connects to every configured plugin and registers the types they serve.
///
/// # Errors
///
/// Returns an error if a plugin cannot be reached or its token is missing.
pub async fn connect_plugins(configs: &[ProviderConfig]) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    for config in configs {
        let client = PluginClient::from_config(config)?;
        let providers = client.into_providers().await?;
        for provider in providers {
            debug!(
                "Provider {} serves {}",
                config.name, provider.schema.resource_type
            );
            registry.register(Arc::new(provider));
        }
    }

    Ok(registry)
}
