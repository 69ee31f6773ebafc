use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::error::DnsError;

/// Buckets idle this long are forgotten by the sweeper.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

/// Per-source token bucket. Each source starts with `capacity` tokens and
/// regains one per elapsed `refill` interval, never above `capacity`.
pub struct RateLimiter {
    capacity: u32,
    refill: Duration,
    idle_timeout: Duration,
    buckets: DashMap<IpAddr, Bucket, FxBuildHasher>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            refill: refill.max(Duration::from_millis(1)),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buckets: DashMap::with_hasher(FxBuildHasher::default()),
            clock,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Spends one token for `ip`. Refill happens before the check and the
    /// check before the spend, so an empty bucket is never driven below zero.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let intervals = elapsed.as_nanos() / self.refill.as_nanos();
        if intervals > 0 {
            let gained = u32::try_from(intervals).unwrap_or(u32::MAX);
            bucket.tokens = bucket.tokens.saturating_add(gained).min(self.capacity);
            // Keep the partial interval so slow trickles still earn tokens.
            let remainder = elapsed.as_nanos() % self.refill.as_nanos();
            bucket.last_refill = now - Duration::from_nanos(remainder as u64);
        }
        bucket.last_seen = now;

        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Identity check plus [`allow`](Self::allow), as the pipeline needs it.
    pub fn check(&self, peer: SocketAddr) -> Result<IpAddr, DnsError> {
        let ip = source_identity(peer)?;
        if self.allow(ip) {
            Ok(ip)
        } else {
            Err(DnsError::RateLimited)
        }
    }

    /// Drops buckets not touched within the idle timeout; returns how many.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_seen) < self.idle_timeout);
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_sources(&self) -> usize {
        self.buckets.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                debug!(
                    event = "ratelimit_sweep",
                    removed,
                    tracked = self.tracked_sources(),
                    "idle buckets swept"
                );
            }
        })
    }
}

/// Bucket key for a peer. IPv4-mapped IPv6 peers share the IPv4 bucket.
pub fn source_identity(peer: SocketAddr) -> Result<IpAddr, DnsError> {
    let ip = peer.ip().to_canonical();
    if ip.is_unspecified() || peer.port() == 0 {
        return Err(DnsError::MissingSourceIdentity);
    }
    Ok(ip)
}
