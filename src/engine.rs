use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::error::{DnsError, ReplyPolicy};
use crate::message::{FLAGS_SUCCESS, build_error_response, build_response};
use crate::proto_utils::{parse_query, transaction_id};
use crate::ratelimit::RateLimiter;
use crate::records::RecordRegistry;
use crate::resolver::Resolver;

/// Where replies go. The listener socket in production, a recorder in tests.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl ReplySink for UdpSocket {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, dest).await
    }
}

#[derive(Clone)]
pub struct Engine {
    registry: Arc<RecordRegistry>,
    limiter: Arc<RateLimiter>,
    resolver: Arc<Resolver>,
    // Per-outcome counters; every received datagram lands in exactly one.
    pub metrics_received: Arc<AtomicU64>,
    pub metrics_answered: Arc<AtomicU64>,
    pub metrics_servfail: Arc<AtomicU64>,
    pub metrics_dropped: Arc<AtomicU64>,
    // Per-request id for log correlation
    pub request_id_counter: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(
        registry: Arc<RecordRegistry>,
        limiter: Arc<RateLimiter>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            registry,
            limiter,
            resolver,
            metrics_received: Arc::new(AtomicU64::new(0)),
            metrics_answered: Arc::new(AtomicU64::new(0)),
            metrics_servfail: Arc::new(AtomicU64::new(0)),
            metrics_dropped: Arc::new(AtomicU64::new(0)),
            request_id_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn metrics_snapshot(&self) -> String {
        format!(
            "received={} answered={} servfail={} dropped={} tracked_sources={}",
            self.metrics_received.load(Ordering::Relaxed),
            self.metrics_answered.load(Ordering::Relaxed),
            self.metrics_servfail.load(Ordering::Relaxed),
            self.metrics_dropped.load(Ordering::Relaxed),
            self.limiter.tracked_sources(),
        )
    }

    /// Runs one datagram through the pipeline. `None` means send nothing.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Option<Bytes> {
        let req_id = self.request_id_counter.fetch_add(1, Ordering::Relaxed);
        self.metrics_received.fetch_add(1, Ordering::Relaxed);
        let t_start = Instant::now();

        match self.process(packet, peer, req_id).await {
            Ok(resp) => {
                self.metrics_answered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    request_id = req_id,
                    phase = "answered",
                    elapsed_ns = t_start.elapsed().as_nanos() as u64,
                    "reply built"
                );
                Some(resp)
            }
            Err(err) => {
                log_failure(req_id, peer, &err);
                match err.reply_policy() {
                    ReplyPolicy::Drop => {
                        self.metrics_dropped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    ReplyPolicy::ServFail => {
                        self.metrics_servfail.fetch_add(1, Ordering::Relaxed);
                        Some(build_error_response(transaction_id(packet)))
                    }
                }
            }
        }
    }

    /// [`handle_packet`](Self::handle_packet) plus delivery through `sink`.
    pub async fn serve_datagram(&self, packet: &[u8], peer: SocketAddr, sink: &dyn ReplySink) {
        let Some(resp) = self.handle_packet(packet, peer).await else {
            return;
        };
        if let Err(err) = sink.send_to(&resp, peer).await {
            warn!(event = "reply_send_failed", client = %peer, error = %err, "failed to send reply");
        }
    }

    async fn process(&self, packet: &[u8], peer: SocketAddr, req_id: u64) -> Result<Bytes, DnsError> {
        let query = parse_query(packet).map_err(DnsError::Malformed)?;
        let client_ip = self.limiter.check(peer)?;

        let kind = self
            .registry
            .get(query.qtype)
            .ok_or(DnsError::UnsupportedType(query.qtype))?;
        debug!(
            request_id = req_id,
            client_ip = %client_ip,
            qname = %query.qname,
            qtype = %kind,
            qclass = query.qclass,
            "query accepted"
        );

        let value = self.resolver.resolve(&query.qname, kind).await?;
        build_response(query.tx_id, FLAGS_SUCCESS, &query.qname, kind, &value, 0)
    }
}

fn log_failure(req_id: u64, peer: SocketAddr, err: &DnsError) {
    let event = err.kind();
    match err {
        DnsError::Validation(_) | DnsError::Encode(_) => {
            error!(request_id = req_id, event, client = %peer, error = %err, "cannot answer query")
        }
        DnsError::Malformed(_) => {
            warn!(request_id = req_id, event, client = %peer, error = %err, "malformed request")
        }
        DnsError::Resolution(_) | DnsError::NoRecords => {
            warn!(request_id = req_id, event, client = %peer, error = %err, "resolution failed")
        }
        DnsError::RateLimited => {
            info!(request_id = req_id, event, client = %peer, "request dropped")
        }
        DnsError::UnsupportedType(_) | DnsError::MissingSourceIdentity => {
            debug!(request_id = req_id, event, client = %peer, error = %err, "request rejected")
        }
    }
}
