use std::collections::HashMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{header, Client, StatusCode};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::client::{ByteStream, ExpireInfo, ResourceClient, SourceRequest, UNKNOWN_CONTENT_LENGTH};
use super::error::SourceError;
use crate::constants::{SOURCE_CONNECT_TIMEOUT, SOURCE_PROBE_TIMEOUT, USER_AGENT};

/// HTTP/HTTPS origin adapter backed by `reqwest`.
///
/// Range support is probed with a one-byte ranged request; expiry with a
/// conditional GET carrying `If-Modified-Since` / `If-None-Match`.
pub struct HttpResourceClient {
    client: Client,
}

impl HttpResourceClient {
    pub fn new() -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(SOURCE_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Creates an adapter over a caller-supplied HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_get(
        &self,
        request: &SourceRequest,
        extra: &HashMap<String, String>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.header {
            builder = builder.header(name, value);
        }
        for (name, value) in extra {
            builder = builder.header(name, value);
        }
        if let Some(range) = &request.range {
            builder = builder.header(header::RANGE, format!("bytes={}", range));
        }
        builder
    }

    async fn send_probe(
        &self,
        request: &SourceRequest,
        extra: &HashMap<String, String>,
    ) -> Result<reqwest::Response, SourceError> {
        self.build_get(request, extra)
            .timeout(SOURCE_PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|err| SourceError::UrlNotReachable {
                url: request.url.clone(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    async fn content_length(&self, request: &SourceRequest) -> Result<i64, SourceError> {
        let response = self.send_probe(request, &HashMap::new()).await?;
        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(response
                .content_length()
                .map(|len| len as i64)
                .unwrap_or(UNKNOWN_CONTENT_LENGTH)),
            status => Err(SourceError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn is_expired(
        &self,
        request: &SourceRequest,
        expire_info: &ExpireInfo,
    ) -> Result<bool, SourceError> {
        // Without validators there is nothing to revalidate against.
        if expire_info.is_empty() {
            return Ok(true);
        }
        let mut conditional = HashMap::new();
        if !expire_info.last_modified.is_empty() {
            conditional.insert(
                header::IF_MODIFIED_SINCE.to_string(),
                expire_info.last_modified.clone(),
            );
        }
        if !expire_info.etag.is_empty() {
            conditional.insert(header::IF_NONE_MATCH.to_string(), expire_info.etag.clone());
        }
        let response = self.send_probe(request, &conditional).await?;
        Ok(response.status() != StatusCode::NOT_MODIFIED)
    }

    async fn is_support_range(&self, request: &SourceRequest) -> Result<bool, SourceError> {
        let mut probe = request.clone();
        probe.range = Some("0-0".to_string());
        let response = self.send_probe(&probe, &HashMap::new()).await?;
        Ok(response.status() == StatusCode::PARTIAL_CONTENT)
    }

    async fn download(&self, request: &SourceRequest) -> Result<ByteStream, SourceError> {
        let (stream, _) = self.download_with_expire_info(request).await?;
        Ok(stream)
    }

    async fn download_with_expire_info(
        &self,
        request: &SourceRequest,
    ) -> Result<(ByteStream, ExpireInfo), SourceError> {
        debug!(url = %request.url, range = ?request.range, "open origin download");
        let response = self
            .build_get(request, &HashMap::new())
            .send()
            .await
            .map_err(|err| SourceError::UrlNotReachable {
                url: request.url.clone(),
                reason: err.to_string(),
            })?;

        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                let header_value = |name: header::HeaderName| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                };
                let expire_info = ExpireInfo {
                    last_modified: header_value(header::LAST_MODIFIED),
                    etag: header_value(header::ETAG),
                };
                let stream = response.bytes_stream().map_err(std::io::Error::other);
                Ok((Box::new(StreamReader::new(Box::pin(stream))), expire_info))
            }
            status => Err(SourceError::UnexpectedStatus(status.as_u16())),
        }
    }
}
