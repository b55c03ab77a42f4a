use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use url::Url;

use super::error::SourceError;

/// Content length reported by an origin that cannot state it.
pub const UNKNOWN_CONTENT_LENGTH: i64 = -1;

/// A boxed streaming body returned by an origin download.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// A request against an origin resource.
#[derive(Debug, Clone, Default)]
pub struct SourceRequest {
    pub url: String,
    pub header: HashMap<String, String>,
    /// Byte range in `start-` or `start-end` form, applied on top of any
    /// range already present in `header`.
    pub range: Option<String>,
}

impl SourceRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            header: HashMap::new(),
            range: None,
        }
    }

    pub fn with_header(mut self, header: HashMap<String, String>) -> Self {
        self.header = header;
        self
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

/// Origin-provided cache validators persisted next to an artifact and fed
/// back to [`ResourceClient::is_expired`] on later requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpireInfo {
    pub last_modified: String,
    pub etag: String,
}

impl ExpireInfo {
    pub fn is_empty(&self) -> bool {
        self.last_modified.is_empty() && self.etag.is_empty()
    }

    pub fn into_map(self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if !self.last_modified.is_empty() {
            map.insert("Last-Modified".to_string(), self.last_modified);
        }
        if !self.etag.is_empty() {
            map.insert("ETag".to_string(), self.etag);
        }
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Self {
        Self {
            last_modified: map.get("Last-Modified").cloned().unwrap_or_default(),
            etag: map.get("ETag").cloned().unwrap_or_default(),
        }
    }
}

/// The capability set the engine consumes from an origin scheme.
///
/// Implementations enforce their own request timeouts.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Length of the resource in bytes, or [`UNKNOWN_CONTENT_LENGTH`] when
    /// the origin cannot report it.
    async fn content_length(&self, request: &SourceRequest) -> Result<i64, SourceError>;

    /// Whether the artifact described by `expire_info` is stale. Adapters
    /// treat empty validators as expired.
    async fn is_expired(
        &self,
        request: &SourceRequest,
        expire_info: &ExpireInfo,
    ) -> Result<bool, SourceError>;

    /// Whether the origin honours ranged reads for this resource.
    async fn is_support_range(&self, request: &SourceRequest) -> Result<bool, SourceError>;

    /// Opens a streaming read of the resource.
    async fn download(&self, request: &SourceRequest) -> Result<ByteStream, SourceError>;

    /// Opens a streaming read and captures the origin's cache validators.
    async fn download_with_expire_info(
        &self,
        request: &SourceRequest,
    ) -> Result<(ByteStream, ExpireInfo), SourceError>;
}

/// Explicit scheme registry.
///
/// Built once at engine construction; there is no global mutable state.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<dyn ResourceClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client` for `scheme`, replacing any previous entry.
    pub fn register(mut self, scheme: impl Into<String>, client: Arc<dyn ResourceClient>) -> Self {
        self.clients.insert(scheme.into().to_lowercase(), client);
        self
    }

    /// Resolves the client responsible for the URL's scheme.
    pub fn for_url(&self, raw_url: &str) -> Result<Arc<dyn ResourceClient>, SourceError> {
        let url = Url::parse(raw_url).map_err(|_| SourceError::InvalidUrl(raw_url.to_string()))?;
        self.clients
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| SourceError::UnsupportedScheme(url.scheme().to_string()))
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }
}
