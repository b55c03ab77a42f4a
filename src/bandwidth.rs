//! Origin bandwidth pacing and the rate-limited digest reader that wraps
//! every origin stream.
//!
//! One [`RateLimiter`] is shared per engine instance; its rate is the
//! configured maximum bandwidth minus the system reservation. Pacing uses a
//! virtual payment clock rather than a stored token count: every acquired
//! byte pushes a `paid_until` instant forward by its transfer time at the
//! configured rate, and a caller only sleeps once that instant runs more
//! than one burst window ahead of real time. The [`LimitedDigestReader`]
//! combines throttling with hash accumulation so the piece pipeline
//! observes already-throttled, already-digested bytes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use crate::constants::BANDWIDTH_BURST_SECS;
use crate::digest::DigestAccumulator;
use crate::source::ByteStream;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Byte-rate pacer for origin downloads.
///
/// `None` inside the mutex means no limit is enforced.
pub struct RateLimiter {
    pacer: Mutex<Option<Pacer>>,
}

struct Pacer {
    bytes_per_sec: u64,
    /// How far the payment clock may run ahead of real time before
    /// callers have to sleep.
    burst_window: Duration,
    /// Virtual instant at which all bytes charged so far are paid off.
    paid_until: Instant,
}

impl Pacer {
    /// Transfer time of `bytes` at the configured rate.
    fn cost_of(&self, bytes: usize) -> Duration {
        let nanos = bytes as u128 * NANOS_PER_SEC / self.bytes_per_sec as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    fn charge(&mut self, bytes: usize, now: Instant) -> Duration {
        // idle time pays debt off but never banks credit beyond "now"
        if self.paid_until < now {
            self.paid_until = now;
        }
        self.paid_until += self.cost_of(bytes);
        self.paid_until
            .saturating_duration_since(now)
            .saturating_sub(self.burst_window)
    }
}

impl RateLimiter {
    /// Creates a pacer for the given rate in bytes per second.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        Arc::new(Self {
            pacer: Mutex::new(Some(Pacer {
                bytes_per_sec: bytes_per_sec.max(1),
                burst_window: Duration::from_secs(BANDWIDTH_BURST_SECS),
                paid_until: Instant::now(),
            })),
        })
    }

    /// Creates a limiter that never makes callers wait.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            pacer: Mutex::new(None),
        })
    }

    /// Charges `bytes` against the budget and returns how long the caller
    /// must sleep before using them.
    pub fn acquire(&self, bytes: usize) -> Duration {
        let mut guard = self.pacer.lock();
        match guard.as_mut() {
            Some(pacer) => pacer.charge(bytes, Instant::now()),
            None => Duration::ZERO,
        }
    }
}

/// A streaming reader that throttles throughput through a shared
/// [`RateLimiter`] and tees every byte through a [`DigestAccumulator`].
pub struct LimitedDigestReader {
    inner: ByteStream,
    limiter: Arc<RateLimiter>,
    digest: DigestAccumulator,
}

impl LimitedDigestReader {
    pub fn new(inner: ByteStream, limiter: Arc<RateLimiter>, digest: DigestAccumulator) -> Self {
        Self {
            inner,
            limiter,
            digest,
        }
    }

    /// Reads up to `buf.len()` bytes, paying for them in the pacer and
    /// feeding them to the digest accumulator.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if n > 0 {
            let wait = self.limiter.acquire(n);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            self.digest.update(&buf[..n]);
        }
        Ok(n)
    }

    /// Reads until `buf` is full or the stream reaches EOF, returning the
    /// number of bytes read. Used by the producer loop to assemble whole
    /// pieces from a stream that may return short reads.
    pub async fn read_full(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Finalizes and returns the source digest as lowercase hex.
    pub fn into_digest_hex(self) -> String {
        self.digest.finalize_hex()
    }
}
