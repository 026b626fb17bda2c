//! HTTP transport to the backend.
//!
//! Both streaming runs and one-shot requests are JSON POSTs. A non-2xx status is a protocol
//! error carrying the status and an excerpt of the body; the orchestrator never retries.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use std::time::Duration;

/// Chunked response body of a streaming run
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub url: String,
    pub body: Value,
}

impl BackendRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            body,
        }
    }
}

#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// POST the request and hand back the response body as it arrives.
    async fn open_stream(&self, request: &BackendRequest) -> Result<ByteStream>;

    /// POST the request and decode the whole response as JSON.
    async fn post_json(&self, request: &BackendRequest) -> Result<Value>;
}

/// reqwest-backed transport
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    excerpt_limit: usize,
}

impl HttpBackend {
    pub fn new(excerpt_limit: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OrchestratorError::Transport(format!("http client build error: {e:?}")))?;
        Ok(Self {
            client,
            excerpt_limit,
        })
    }

    pub fn with_client(client: reqwest::Client, excerpt_limit: usize) -> Self {
        Self {
            client,
            excerpt_limit,
        }
    }

    async fn send(&self, request: &BackendRequest, accept: &str) -> Result<reqwest::Response> {
        let res = self
            .client
            .post(&request.url)
            .header(reqwest::header::ACCEPT, accept)
            .json(&request.body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        // a body that cannot be read still yields the status
        let text = res.text().await.unwrap_or_default();
        tracing::warn!("backend {} returned HTTP {}", request.url, status.as_u16());
        Err(OrchestratorError::protocol(
            status.as_u16(),
            &text,
            self.excerpt_limit,
        ))
    }
}

#[async_trait]
impl BackendTransport for HttpBackend {
    async fn open_stream(&self, request: &BackendRequest) -> Result<ByteStream> {
        tracing::debug!("opening stream to {}", request.url);
        let res = self.send(request, "application/x-ndjson").await?;
        Ok(res.bytes_stream().map_err(transport_error).boxed())
    }

    async fn post_json(&self, request: &BackendRequest) -> Result<Value> {
        tracing::debug!("posting request to {}", request.url);
        let res = self.send(request, "application/json").await?;
        let bytes = res.bytes().await.map_err(transport_error)?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn transport_error(e: reqwest::Error) -> OrchestratorError {
    OrchestratorError::Transport(e.to_string())
}
