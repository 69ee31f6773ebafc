use std::hash::Hasher;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use rustc_hash::FxHasher;

use crate::records::RecordData;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: RecordData,
    pub expires_at: Instant,
    // Store validation fields to handle hash collisions
    pub qname: Arc<str>,
    pub qtype: u16,
}

impl CacheEntry {
    #[inline]
    fn matches(&self, qname: &str, qtype: u16) -> bool {
        self.qtype == qtype && self.qname.eq_ignore_ascii_case(qname)
    }
}

/// Resolved answers keyed by (domain, type). Entries are checked against
/// `expires_at` on every read; moka's own TTL only bounds how long stale
/// entries occupy memory.
#[derive(Clone)]
pub struct AnswerCache {
    inner: Cache<u64, CacheEntry>,
}

impl AnswerCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    /// Fresh value for `(qname, qtype)` at `now`. An expired entry stays until
    /// the next insert for the key overwrites it or moka's TTL evicts it, so a
    /// concurrent refresh is never thrown away.
    pub fn get(&self, qname: &str, qtype: u16, now: Instant) -> Option<RecordData> {
        let hit = self.inner.get(&cache_hash(qname, qtype))?;
        if !hit.matches(qname, qtype) || now >= hit.expires_at {
            return None;
        }
        Some(hit.value)
    }

    pub fn insert(&self, qname: &str, qtype: u16, value: RecordData, expires_at: Instant) {
        let entry = CacheEntry {
            value,
            expires_at,
            qname: Arc::from(qname.to_ascii_lowercase()),
            qtype,
        };
        self.inner.insert(cache_hash(qname, qtype), entry);
    }
}

/// Case-insensitive hash of the key without allocating a lowered copy.
#[inline]
fn cache_hash(qname: &str, qtype: u16) -> u64 {
    let mut h = FxHasher::default();
    for b in qname.bytes() {
        h.write_u8(b.to_ascii_lowercase());
    }
    h.write_u16(qtype);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> AnswerCache {
        AnswerCache::new(100, Duration::from_secs(300))
    }

    fn ip(s: &str) -> RecordData {
        RecordData::Address(s.to_string())
    }

    #[test]
    fn hit_before_expiry_miss_after() {
        let cache = cache();
        let now = Instant::now();
        cache.insert("example.com", 1, ip("192.0.2.1"), now + Duration::from_secs(5));

        assert_eq!(cache.get("example.com", 1, now), Some(ip("192.0.2.1")));
        assert_eq!(
            cache.get("example.com", 1, now + Duration::from_secs(4)),
            Some(ip("192.0.2.1"))
        );
        assert_eq!(cache.get("example.com", 1, now + Duration::from_secs(5)), None);
    }

    #[test]
    fn expired_read_keeps_a_refresh_written_meanwhile() {
        let cache = cache();
        let now = Instant::now();
        let expired_at = now + Duration::from_secs(5);
        cache.insert("example.com", 1, ip("192.0.2.1"), expired_at);

        // A refresh lands between two readers seeing the stale entry.
        assert_eq!(cache.get("example.com", 1, expired_at), None);
        assert!(cache.inner.contains_key(&cache_hash("example.com", 1)));
        cache.insert("example.com", 1, ip("192.0.2.2"), expired_at + Duration::from_secs(60));
        assert_eq!(cache.get("example.com", 1, expired_at), Some(ip("192.0.2.2")));
    }

    #[test]
    fn key_includes_type_and_ignores_case() {
        let cache = cache();
        let now = Instant::now();
        let later = now + Duration::from_secs(60);
        cache.insert("Example.COM", 1, ip("192.0.2.1"), later);
        cache.insert("example.com", 28, ip("2001:db8::1"), later);

        assert_eq!(cache.get("example.com", 1, now), Some(ip("192.0.2.1")));
        assert_eq!(cache.get("EXAMPLE.com", 28, now), Some(ip("2001:db8::1")));
        assert_eq!(cache.get("example.com", 15, now), None);
    }

    #[test]
    fn refresh_overwrites() {
        let cache = cache();
        let now = Instant::now();
        let later = now + Duration::from_secs(60);
        cache.insert("example.com", 1, ip("192.0.2.1"), later);
        cache.insert("example.com", 1, ip("192.0.2.2"), later);
        assert_eq!(cache.get("example.com", 1, now), Some(ip("192.0.2.2")));
    }
}
