//! Origin adapters.
//!
//! The engine never talks to an origin directly; it consumes the
//! capability set of [`ResourceClient`]: probe the content length, decide
//! whether a cached artifact has expired, find out whether ranged reads are
//! supported, and open a streaming download. Implementations for concrete
//! schemes are registered explicitly in a [`ClientRegistry`] at engine
//! construction.
//!
//! # Components
//!
//! - [`ResourceClient`] - Capability set an origin scheme must provide
//! - [`ClientRegistry`] - Explicit scheme → client map
//! - [`HttpResourceClient`] - HTTP/HTTPS implementation backed by `reqwest`
//! - [`SourceRequest`] / [`ExpireInfo`] - Request and cache validator types

mod client;
mod error;
mod http;

pub use client::{
    ByteStream, ClientRegistry, ExpireInfo, ResourceClient, SourceRequest, UNKNOWN_CONTENT_LENGTH,
};
pub use error::SourceError;
pub use http::HttpResourceClient;
