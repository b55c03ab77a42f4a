use std::collections::HashMap;

use crate::config::PieceConfig;
use crate::constants::{
    PIECE_SIZE_GROWTH_STEP, PIECE_SIZE_STEP_BYTES, PIECE_SIZE_THRESHOLD, UNKNOWN_SOURCE_LENGTH,
};

/// Caller-supplied description of a resource to seed.
#[derive(Debug, Clone, Default)]
pub struct SeedRequest {
    /// Raw origin URL.
    pub url: String,
    /// Extra request headers forwarded to the origin.
    pub headers: HashMap<String, String>,
    /// Declared digest in `algo:hex` form, empty when absent.
    pub digest: String,
    /// Declared byte range within the origin resource, empty when absent.
    pub range: String,
    /// Free-form tag participating in the fingerprint.
    pub tag: String,
    /// Query parameters excluded from URL canonicalization.
    pub filters: Vec<String>,
}

impl SeedRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Lifecycle status of a seed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Waiting,
    Running,
    Success,
    Failed,
    SourceError,
}

impl TaskStatus {
    /// Terminal states plus Waiting: a frozen task may be (re-)triggered.
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Waiting | Self::Failed | Self::SourceError)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::SourceError)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A fingerprinted, cachable artifact backed by an origin URL.
///
/// Created on first registration; mutated exclusively by the owning fetch
/// while Running; terminal states persist until garbage collection.
#[derive(Debug, Clone)]
pub struct SeedTask {
    /// Fingerprint identifying the task.
    pub id: String,
    /// Raw origin URL as supplied by the caller.
    pub raw_url: String,
    /// Canonical URL after filter application.
    pub task_url: String,
    pub headers: HashMap<String, String>,
    /// Declared digest in `algo:hex` form, empty when absent.
    pub digest: String,
    pub range: String,
    pub tag: String,
    /// Filter list serialized as `a&b&c` for persistence.
    pub filter: String,
    /// Length of the requested source range, or
    /// [`UNKNOWN_SOURCE_LENGTH`](crate::constants::UNKNOWN_SOURCE_LENGTH).
    pub source_file_length: i64,
    /// Length of the stored artifact once known.
    pub cdn_file_length: i64,
    pub piece_size: u32,
    pub status: TaskStatus,
    pub total_piece_count: u32,
    /// Digest observed while streaming the source.
    pub source_real_digest: String,
    /// Aggregate piece signature.
    pub piece_md5_sign: String,
}

impl SeedTask {
    pub fn new(
        id: String,
        request: &SeedRequest,
        task_url: String,
        source_file_length: i64,
        piece_size: u32,
    ) -> Self {
        Self {
            id,
            raw_url: request.url.clone(),
            task_url,
            headers: request.headers.clone(),
            digest: request.digest.clone(),
            range: request.range.clone(),
            tag: request.tag.clone(),
            filter: request.filters.join("&"),
            source_file_length,
            cdn_file_length: 0,
            piece_size,
            status: TaskStatus::Waiting,
            total_piece_count: 0,
            source_real_digest: String::new(),
            piece_md5_sign: String::new(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.status.is_frozen()
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Expected piece count, 0 when the source length is unknown.
    pub fn expected_piece_count(&self) -> u32 {
        if self.source_file_length <= 0 || self.piece_size == 0 {
            return 0;
        }
        let divisor = self.piece_size as i64;
        ((self.source_file_length + divisor - 1) / divisor) as u32
    }

    pub fn update_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    /// Records the outcome of a finished fetch.
    pub fn update_result(
        &mut self,
        status: TaskStatus,
        source_real_digest: String,
        piece_md5_sign: String,
        source_file_length: i64,
        cdn_file_length: i64,
        total_piece_count: u32,
    ) {
        self.status = status;
        self.source_real_digest = source_real_digest;
        self.piece_md5_sign = piece_md5_sign;
        self.source_file_length = source_file_length;
        self.cdn_file_length = cdn_file_length;
        self.total_piece_count = total_piece_count;
    }
}

/// Derives the piece size for a source of the given length.
///
/// Starts from the default, grows by one step for every
/// [`PIECE_SIZE_STEP_BYTES`] above [`PIECE_SIZE_THRESHOLD`], clamps to the
/// maximum, and finally grows as needed to keep the total piece count under
/// the per-task ceiling. Unknown lengths use the default.
pub fn piece_size_for(source_file_length: i64, cfg: &PieceConfig) -> u32 {
    if source_file_length == UNKNOWN_SOURCE_LENGTH || source_file_length <= 0 {
        return cfg.default_size;
    }
    let mut size = cfg.default_size;
    if source_file_length > PIECE_SIZE_THRESHOLD {
        let steps_num = source_file_length - PIECE_SIZE_THRESHOLD;
        let steps = (steps_num + PIECE_SIZE_STEP_BYTES - 1) / PIECE_SIZE_STEP_BYTES;
        let grown = size as i64 + steps * PIECE_SIZE_GROWTH_STEP as i64;
        size = grown.min(cfg.max_size as i64) as u32;
    }
    // keep the piece count under the ceiling even for very large sources
    let max_pieces = cfg.max_pieces_per_task as i64;
    let min_for_count = (source_file_length + max_pieces - 1) / max_pieces;
    if (size as i64) < min_for_count {
        size = min_for_count.min(i64::from(u32::MAX)) as u32;
    }
    size
}
