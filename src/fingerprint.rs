//! Task fingerprinting.
//!
//! A fingerprint deterministically identifies a seed task: SHA-256 over the
//! canonicalized URL followed by the declared digest, range, and tag (each
//! appended only when non-empty). Requests that differ only in filtered
//! query parameters map to the same fingerprint and therefore the same
//! cached artifact.

use url::Url;

use crate::digest::sha256_hex_concat;
use crate::task::{SeedRequest, TaskError};

/// Canonicalizes a URL by removing the query parameters named in `filters`
/// and stripping any fragment. Remaining query pairs keep their original
/// order so canonicalization is stable.
pub fn canonical_url(raw_url: &str, filters: &[String]) -> Result<String, TaskError> {
    let mut url = Url::parse(raw_url).map_err(|_| TaskError::InvalidValue {
        field: "url",
        value: raw_url.to_string(),
    })?;
    if !url.has_host() {
        return Err(TaskError::InvalidValue {
            field: "url",
            value: raw_url.to_string(),
        });
    }
    url.set_fragment(None);
    if url.query().is_some() && !filters.is_empty() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !filters.iter().any(|f| f == k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }
    Ok(url.to_string())
}

/// Computes the fingerprint (task id) for a seed request.
pub fn fingerprint(request: &SeedRequest) -> Result<String, TaskError> {
    let canonical = canonical_url(&request.url, &request.filters)?;
    let mut parts = vec![canonical];
    if !request.digest.is_empty() {
        parts.push(request.digest.clone());
    }
    if !request.range.is_empty() {
        parts.push(request.range.clone());
    }
    if !request.tag.is_empty() {
        parts.push(request.tag.clone());
    }
    Ok(sha256_hex_concat(parts))
}
