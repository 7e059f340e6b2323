//! Fetching responses.

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;

use opgraph_core::OpError;

use super::processor::ResponsePayload;
use super::request::{HttpMethod, ServiceRequest};

/// Retrieves the raw response for a request.
///
/// `Ok(None)` means the request succeeded with no body.
#[async_trait]
pub trait ResponseFetcher: Send + Sync {
    async fn fetch(&self, request: &ServiceRequest) -> Result<Option<ResponsePayload>, OpError>;
}

/// `reqwest`-backed fetcher.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    inner: reqwest::Client,
    streaming: bool,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            inner: client,
            streaming: false,
        }
    }

    /// Hand the body over as a stream instead of buffering it.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl ResponseFetcher for HttpFetcher {
    async fn fetch(&self, request: &ServiceRequest) -> Result<Option<ResponsePayload>, OpError> {
        debug!(method = %request.method, url = %request.url, "Fetching");

        let mut builder = self
            .inner
            .request(request.method.into(), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OpError::execution(format!("{request} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OpError::execution(format!("HTTP {status}: {}", request.url)));
        }

        if self.streaming {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| OpError::execution(e.to_string())));
            return Ok(Some(ResponsePayload::Stream(stream.boxed())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| OpError::execution(format!("{request} body: {e}")))?;
        debug!(url = %request.url, bytes = body.len(), "Fetched");
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ResponsePayload::Bytes(body)))
        }
    }
}
