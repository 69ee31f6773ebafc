use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::cache::AnswerCache;
use crate::clock::Clock;
use crate::error::DnsError;
use crate::records::{RecordData, RecordKind, RecordRegistry};
use crate::upstream::{Upstream, UpstreamAnswer, UpstreamRecord};

/// Cache lifetime for values whose upstream answer carried no TTL, and the
/// ceiling for those that did.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(5 * 60);

/// How one record type is fetched from the upstream and reduced to a single
/// answer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Ipv4,
    Ipv6,
    Mail,
    Text,
    Alias,
    NameServer,
}

impl Strategy {
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::A => Strategy::Ipv4,
            RecordKind::Aaaa => Strategy::Ipv6,
            RecordKind::Mx => Strategy::Mail,
            RecordKind::Txt => Strategy::Text,
            RecordKind::Cname => Strategy::Alias,
            RecordKind::Ns => Strategy::NameServer,
        }
    }

    fn query_kind(self) -> RecordKind {
        match self {
            Strategy::Ipv4 => RecordKind::A,
            Strategy::Ipv6 => RecordKind::Aaaa,
            Strategy::Mail => RecordKind::Mx,
            Strategy::Text => RecordKind::Txt,
            Strategy::Alias => RecordKind::Cname,
            Strategy::NameServer => RecordKind::Ns,
        }
    }

    fn select(self, answer: &UpstreamAnswer) -> Option<RecordData> {
        let mut records = answer.records.iter();
        match self {
            Strategy::Ipv4 => records.find_map(|r| match r {
                UpstreamRecord::Ip(IpAddr::V4(v4)) => Some(RecordData::Address(v4.to_string())),
                _ => None,
            }),
            Strategy::Ipv6 => records.find_map(|r| match r {
                UpstreamRecord::Ip(IpAddr::V6(v6)) if v6.to_ipv4_mapped().is_none() => {
                    Some(RecordData::Address(v6.to_string()))
                }
                _ => None,
            }),
            Strategy::Mail => records
                .filter_map(|r| match r {
                    UpstreamRecord::Mx {
                        preference,
                        exchange,
                    } => Some((*preference, exchange)),
                    _ => None,
                })
                .min_by_key(|(preference, _)| *preference)
                .map(|(preference, exchange)| RecordData::Mail {
                    preference,
                    exchange: exchange.clone(),
                }),
            Strategy::Text => records.find_map(|r| match r {
                UpstreamRecord::Txt(parts) => Some(RecordData::Text(parts.clone())),
                _ => None,
            }),
            Strategy::Alias | Strategy::NameServer => records.find_map(|r| match r {
                UpstreamRecord::Name(target) => Some(RecordData::Domain(target.clone())),
                _ => None,
            }),
        }
    }

    /// Queries `upstream` and returns the chosen value with the answer's TTL.
    pub async fn run(
        self,
        upstream: &dyn Upstream,
        domain: &str,
    ) -> Result<(RecordData, Option<u32>), DnsError> {
        let answer = upstream.lookup(domain, self.query_kind()).await?;
        let value = self.select(&answer).ok_or(DnsError::NoRecords)?;
        Ok((value, answer.min_ttl))
    }
}

/// Cache in front of per-type upstream strategies.
pub struct Resolver {
    upstream: Arc<dyn Upstream>,
    strategies: FxHashMap<u16, Strategy>,
    cache: AnswerCache,
    freshness: Duration,
    clock: Arc<dyn Clock>,
}

impl Resolver {
    /// Registers the default strategy for every type in `registry`.
    pub fn new(
        upstream: Arc<dyn Upstream>,
        registry: &RecordRegistry,
        cache: AnswerCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let strategies = registry
            .kinds()
            .map(|k| (k.code(), Strategy::for_kind(k)))
            .collect();
        Self {
            upstream,
            strategies,
            cache,
            freshness: DEFAULT_FRESHNESS,
            clock,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Replaces (or with `None`, removes) the strategy for `kind`.
    #[cfg(test)]
    pub fn with_strategy(mut self, kind: RecordKind, strategy: Option<Strategy>) -> Self {
        match strategy {
            Some(s) => self.strategies.insert(kind.code(), s),
            None => self.strategies.remove(&kind.code()),
        };
        self
    }

    /// Cached value for `(domain, kind)` or a freshly resolved and validated one.
    pub async fn resolve(&self, domain: &str, kind: RecordKind) -> Result<RecordData, DnsError> {
        let code = kind.code();
        if let Some(hit) = self.cache.get(domain, code, self.clock.now()) {
            debug!(event = "cache_hit", qname = %domain, qtype = %kind, "served from cache");
            return Ok(hit);
        }

        let strategy = *self
            .strategies
            .get(&code)
            .ok_or(DnsError::UnsupportedType(code))?;
        let (value, ttl) = strategy.run(self.upstream.as_ref(), domain).await?;

        if let Err(err) = kind.validate(&value) {
            error!(
                event = "upstream_validation_failed",
                qname = %domain,
                qtype = %kind,
                value = %value,
                error = %err,
                "upstream value does not fit record type"
            );
            return Err(err.into());
        }

        let window = ttl
            .map(|t| Duration::from_secs(u64::from(t)).min(self.freshness))
            .unwrap_or(self.freshness);
        self.cache
            .insert(domain, code, value.clone(), self.clock.now() + window);
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::UpstreamError;

    /// Upstream serving canned answers and counting calls.
    #[derive(Default)]
    pub struct StaticUpstream {
        answers: Mutex<FxHashMap<(String, u16), UpstreamAnswer>>,
        pub calls: AtomicUsize,
    }

    impl StaticUpstream {
        pub fn answer(&self, domain: &str, kind: RecordKind, records: Vec<UpstreamRecord>) {
            let answer = UpstreamAnswer {
                records,
                min_ttl: None,
            };
            self.answers
                .lock()
                .expect("answers lock")
                .insert((domain.to_string(), kind.code()), answer);
        }

        pub fn answer_with_ttl(&self, domain: &str, kind: RecordKind, records: Vec<UpstreamRecord>, ttl: u32) {
            let answer = UpstreamAnswer {
                records,
                min_ttl: Some(ttl),
            };
            self.answers
                .lock()
                .expect("answers lock")
                .insert((domain.to_string(), kind.code()), answer);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for StaticUpstream {
        async fn lookup(&self, domain: &str, kind: RecordKind) -> Result<UpstreamAnswer, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .expect("answers lock")
                .get(&(domain.to_string(), kind.code()))
                .cloned()
                .ok_or_else(|| UpstreamError::Rcode(hickory_proto::op::ResponseCode::NXDomain))
        }
    }
}
