use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("no client registered for scheme: {0}")]
    UnsupportedScheme(String),

    #[error("url not reachable: {url}: {reason}")]
    UrlNotReachable { url: String, reason: String },

    #[error("origin does not support range requests: {0}")]
    RangeNotSupported(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
