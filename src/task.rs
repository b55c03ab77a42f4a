//! Seed tasks and the task registry.
//!
//! A seed task is a fingerprinted, cachable artifact backed by an origin
//! URL. The registry guarantees each fingerprint maps to at most one task
//! and that at most one fetch runs per fingerprint; concurrent requests for
//! the same fingerprint attach to the in-flight task as subscribers.
//!
//! # Components
//!
//! - [`SeedRequest`] - Caller-supplied description of a resource
//! - [`SeedTask`] / [`TaskStatus`] - The task entity and its lifecycle
//! - [`TaskRegistry`] - fingerprint → task map with per-key locking

mod entity;
mod registry;

pub use entity::{piece_size_for, SeedRequest, SeedTask, TaskStatus};
pub use registry::TaskRegistry;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue {
        field: &'static str,
        value: String,
    },

    #[error("url not reachable: {url}: {reason}")]
    UrlNotReachable { url: String, reason: String },

    #[error("data not found: {0}")]
    NotFound(String),

    #[error("task id duplicate: {id} maps to both {existing} and {incoming}")]
    IdDuplicate {
        id: String,
        existing: String,
        incoming: String,
    },
}
