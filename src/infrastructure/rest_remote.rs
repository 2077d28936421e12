//! REST client for the hosted backend.
//!
//! Talks to PostgREST-style endpoints (`/rest/v1/<collection>`) and tags
//! every failure as network, timeout, unauthorized, validation, or conflict.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use super::remote::{RemoteClient, RemoteResult};
use crate::domain::{AppError, FetchScope, MutationOperation, QueuedMutation, RemoteError, Result};

/// Header carrying the mutation id.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Remote client over HTTPS.
pub struct RestRemoteClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestRemoteClient {
    /// Build a client for `base_url`.
    ///
    /// # Errors
    /// Returns `Config` if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, collection: &str) -> String {
        format!("{}/rest/v1/{collection}", self.base_url)
    }

    fn request(&self, method: Method, collection: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, self.endpoint(collection))
            .header(header::ACCEPT, "application/json");

        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> RemoteResult<Response> {
        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> RemoteError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        body
    };

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Network(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
        s if s.is_client_error() => RemoteError::Validation(message),
        _ => RemoteError::Network(message),
    }
}

fn scope_filters(scope: &FetchScope) -> Vec<(&'static str, String)> {
    let mut filters = Vec::new();
    if let Some(tenant) = &scope.tenant_id {
        filters.push(("tenant_id", format!("eq.{tenant}")));
    }
    if let Some(parent) = &scope.parent_id {
        filters.push(("parent_id", format!("eq.{parent}")));
    }
    filters
}

#[async_trait]
impl RemoteClient for RestRemoteClient {
    async fn fetch_collection(&self, name: &str, scope: &FetchScope) -> RemoteResult<Vec<Value>> {
        let builder = self
            .request(Method::GET, name)
            .query(&scope_filters(scope));

        let response = Self::send(builder).await?;
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RemoteError::Network(format!("Malformed response for {name}: {e}")))
    }

    async fn apply_mutation(&self, mutation: &QueuedMutation) -> RemoteResult<Value> {
        let collection = mutation.resource_type.as_str();

        let builder = match mutation.operation {
            MutationOperation::Create => self.request(Method::POST, collection),
            MutationOperation::Update | MutationOperation::Delete => {
                let id = mutation.record_id().ok_or_else(|| {
                    RemoteError::Validation(format!("{} requires a record id", mutation.summary()))
                })?;
                let method = if mutation.operation == MutationOperation::Update {
                    Method::PATCH
                } else {
                    Method::DELETE
                };
                self.request(method, collection)
                    .query(&[("id", format!("eq.{id}"))])
            }
        };

        let builder = builder
            .header(IDEMPOTENCY_HEADER, mutation.idempotency_key())
            .header("Prefer", "return=representation");
        let builder = if mutation.operation == MutationOperation::Delete {
            builder
        } else {
            builder.json(&mutation.payload)
        };

        tracing::debug!(
            mutation_id = mutation.id,
            resource = collection,
            operation = %mutation.operation,
            "Submitting mutation"
        );

        let response = Self::send(builder).await?;
        let body = response.text().await.map_err(classify_transport)?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }
}
