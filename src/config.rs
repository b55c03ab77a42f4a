//! Engine configuration.
//!
//! All tunable parameters grouped into logical sections, with defaults
//! drawn from [`constants`](crate::constants). An engine is constructed
//! from one [`Config`] value; nothing reads configuration globally.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;

/// Top-level configuration for a seed engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ceiling on origin-facing bandwidth in bytes per second.
    pub max_bandwidth: u64,
    /// Bandwidth reserved for the rest of the node; the token bucket rate
    /// is `max_bandwidth - system_reserved_bandwidth`.
    pub system_reserved_bandwidth: u64,
    /// Cap on concurrent persistence workers per task.
    pub writer_parallelism: usize,
    pub piece: PieceConfig,
    pub gc: GcConfig,
    pub progress: ProgressConfig,
    pub storage: StorageConfig,
}

/// Piece sizing rules.
#[derive(Debug, Clone)]
pub struct PieceConfig {
    /// Piece size used for small sources.
    pub default_size: u32,
    /// Hard ceiling on the piece size.
    pub max_size: u32,
    /// Ceiling on the number of pieces a single task may produce.
    pub max_pieces_per_task: u32,
}

/// Garbage collection thresholds and cadence.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Usage above which an incremental sweep starts.
    pub young_threshold: u64,
    /// Usage above which an aggressive sweep starts.
    pub full_threshold: u64,
    /// Tasks idle for longer than this are cold and eligible for eviction.
    pub interval_threshold: Duration,
    /// Overshoot factor applied to the space target when reclaiming.
    pub clean_ratio: f64,
    /// Delay before the first background sweep.
    pub initial_delay: Duration,
    /// Period between background sweeps.
    pub period: Duration,
}

/// Progress broker fan-out parameters.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Bounded capacity of each subscriber channel.
    pub subscriber_buffer: usize,
    /// How long a publish may block on one subscriber before the event
    /// is dropped for it.
    pub subscriber_timeout: Duration,
}

/// Storage layout and capacity accounting.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for payloads and sidecars.
    pub base_dir: PathBuf,
    /// Total space budget the engine may occupy under `base_dir`.
    pub capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_bandwidth: DEFAULT_MAX_BANDWIDTH,
            system_reserved_bandwidth: DEFAULT_RESERVED_BANDWIDTH,
            writer_parallelism: MAX_WRITER_PARALLELISM,
            piece: PieceConfig::default(),
            gc: GcConfig::default(),
            progress: ProgressConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for PieceConfig {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_PIECE_SIZE,
            max_size: MAX_PIECE_SIZE,
            max_pieces_per_task: MAX_PIECES_PER_TASK,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            young_threshold: GC_YOUNG_THRESHOLD,
            full_threshold: GC_FULL_THRESHOLD,
            interval_threshold: GC_INTERVAL_THRESHOLD,
            clean_ratio: GC_CLEAN_RATIO,
            initial_delay: GC_INITIAL_DELAY,
            period: GC_PERIOD,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: SUBSCRIBER_BUFFER,
            subscriber_timeout: SUBSCRIBER_TIMEOUT,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./repo"),
            capacity: GC_FULL_THRESHOLD * 2,
        }
    }
}

impl Config {
    /// Effective token bucket rate for origin downloads.
    pub fn download_rate(&self) -> u64 {
        self.max_bandwidth.saturating_sub(self.system_reserved_bandwidth)
    }
}
