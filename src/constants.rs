//! Engine constants and tuning parameters.
//!
//! This module contains the constants used throughout the seed engine,
//! including piece sizing rules, pipeline limits, timeouts, and garbage
//! collection thresholds. Most of them can be overridden through
//! [`Config`](crate::config::Config); the values here are the defaults.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// User agent string for origin HTTP requests
pub const USER_AGENT: &str = "rseed/0.1.0";

// ============================================================================
// Source length
// ============================================================================

/// Sentinel for an origin that cannot report its content length
pub const UNKNOWN_SOURCE_LENGTH: i64 = -1;

// ============================================================================
// Piece sizing
// ============================================================================

/// Default piece size (4 MiB)
pub const DEFAULT_PIECE_SIZE: u32 = 4 * 1024 * 1024;

/// Maximum piece size (16 MiB)
pub const MAX_PIECE_SIZE: u32 = 16 * 1024 * 1024;

/// Piece size growth per [`PIECE_SIZE_STEP_BYTES`] above the threshold (1 MiB)
pub const PIECE_SIZE_GROWTH_STEP: u32 = 1024 * 1024;

/// Source size threshold above which the piece size starts growing (200 MiB)
pub const PIECE_SIZE_THRESHOLD: i64 = 200 * 1024 * 1024;

/// Every additional span of this many bytes above the threshold grows the
/// piece size by one step (100 MiB)
pub const PIECE_SIZE_STEP_BYTES: i64 = 100 * 1024 * 1024;

/// Ceiling on the number of pieces a single task may produce
pub const MAX_PIECES_PER_TASK: u32 = 300;

// ============================================================================
// Write pipeline
// ============================================================================

/// Cap on concurrent persistence workers per task
pub const MAX_WRITER_PARALLELISM: usize = 4;

// ============================================================================
// Progress fan-out
// ============================================================================

/// Bounded capacity of each subscriber channel
pub const SUBSCRIBER_BUFFER: usize = 4;

/// How long a publish may block on one subscriber before the event is dropped
pub const SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Origin probing
// ============================================================================

/// Attempts to obtain the content length before giving up on the origin
pub const CONTENT_LENGTH_RETRIES: u32 = 3;

/// HTTP timeout for origin probe requests (HEAD, conditional GET)
pub const SOURCE_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP connect timeout for origin requests
pub const SOURCE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Garbage collection
// ============================================================================

/// Usage above which an incremental sweep starts (200 GiB)
pub const GC_YOUNG_THRESHOLD: u64 = 200 * 1024 * 1024 * 1024;

/// Usage above which an aggressive sweep starts (250 GiB)
pub const GC_FULL_THRESHOLD: u64 = 250 * 1024 * 1024 * 1024;

/// Tasks idle for longer than this are cold and eligible for eviction
pub const GC_INTERVAL_THRESHOLD: Duration = Duration::from_secs(2 * 3600);

/// Overshoot factor applied to the space target when reclaiming
pub const GC_CLEAN_RATIO: f64 = 1.0;

/// Delay before the first background sweep
pub const GC_INITIAL_DELAY: Duration = Duration::from_secs(6);

/// Period between background sweeps
pub const GC_PERIOD: Duration = Duration::from_secs(15);

/// Extra free space required beyond the requested reservation (5 GiB)
pub const FREE_SPACE_SAFETY_MARGIN: u64 = 5 * 1024 * 1024 * 1024;

// ============================================================================
// Bandwidth
// ============================================================================

/// Default ceiling on origin-facing bandwidth (200 MiB/s)
pub const DEFAULT_MAX_BANDWIDTH: u64 = 200 * 1024 * 1024;

/// Bandwidth reserved for the rest of the node (20 MiB/s)
pub const DEFAULT_RESERVED_BANDWIDTH: u64 = 20 * 1024 * 1024;

/// Length of the burst window the pacer may run ahead of real time
pub const BANDWIDTH_BURST_SECS: u64 = 2;
