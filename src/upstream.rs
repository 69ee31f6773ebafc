use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::records::RecordKind;

/// One answer record in the shape the resolver strategies consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamRecord {
    Ip(IpAddr),
    Mx { preference: u16, exchange: String },
    Txt(Vec<String>),
    /// CNAME or NS target.
    Name(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamAnswer {
    pub records: Vec<UpstreamRecord>,
    /// Smallest TTL among the answers, if any carried one.
    pub min_ttl: Option<u32>,
}

/// The remote resolution service consulted on a cache miss.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Zero or more records for `domain`, queried as `kind`.
    async fn lookup(&self, domain: &str, kind: RecordKind) -> Result<UpstreamAnswer, UpstreamError>;
}

/// Forwards each lookup as a recursive UDP query to a single upstream server.
pub struct UdpUpstream {
    addr: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    fn build_query(&self, domain: &str, kind: RecordKind) -> Result<(u16, Vec<u8>), UpstreamError> {
        // Fresh random ID per query; replies are only accepted with a matching one.
        let id = fastrand::u16(..);
        let mut name = Name::from_str(domain)?;
        name.set_fqdn(true);

        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(name, RecordType::from(kind.code())));
        Ok((id, msg.to_vec()?))
    }

    async fn exchange(&self, id: u16, packet: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let sock = bind_ephemeral(self.addr)?;
        sock.connect(self.addr).await?;
        sock.send(packet).await?;

        let mut buf = [0u8; 4096];
        let recv = timeout(self.timeout, async {
            loop {
                let size = sock.recv(&mut buf).await?;
                // Connected socket: only the upstream can reach us, but stale
                // or spoofed replies still need the ID check.
                if size >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                    return Ok::<_, std::io::Error>(buf[..size].to_vec());
                }
                debug!(event = "upstream_stray_reply", size, "ignoring reply with foreign id");
            }
        })
        .await;

        match recv {
            Ok(res) => Ok(res?),
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn lookup(&self, domain: &str, kind: RecordKind) -> Result<UpstreamAnswer, UpstreamError> {
        let start = std::time::Instant::now();
        let (id, packet) = self.build_query(domain, kind)?;
        let res = match self.exchange(id, &packet).await {
            Ok(raw) => Message::from_vec(&raw)
                .map_err(UpstreamError::from)
                .and_then(|msg| parse_answer(&msg)),
            Err(err) => Err(err),
        };
        match &res {
            Ok(answer) => debug!(
                upstream = %self.addr,
                qname = %domain,
                qtype = %kind,
                records = answer.records.len(),
                elapsed_us = start.elapsed().as_micros() as u64,
                "upstream answered"
            ),
            Err(err) => warn!(
                upstream = %self.addr,
                qname = %domain,
                qtype = %kind,
                error = %err,
                elapsed_us = start.elapsed().as_micros() as u64,
                "upstream call failed"
            ),
        }
        res
    }
}

fn bind_ephemeral(upstream: SocketAddr) -> Result<UdpSocket, UpstreamError> {
    let (domain, local): (Domain, SocketAddr) = if upstream.is_ipv4() {
        (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into())
    } else {
        (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into())
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Maps the answer section into [`UpstreamRecord`]s. Anything but NOERROR is
/// a failure; unsupported record types are skipped.
pub fn parse_answer(msg: &Message) -> Result<UpstreamAnswer, UpstreamError> {
    if msg.response_code() != ResponseCode::NoError {
        return Err(UpstreamError::Rcode(msg.response_code()));
    }

    let mut answer = UpstreamAnswer::default();
    for record in msg.answers() {
        let parsed = match record.data() {
            Some(RData::A(a)) => UpstreamRecord::Ip(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => UpstreamRecord::Ip(IpAddr::V6(aaaa.0)),
            Some(RData::MX(mx)) => UpstreamRecord::Mx {
                preference: mx.preference(),
                exchange: name_to_string(mx.exchange()),
            },
            Some(RData::TXT(txt)) => UpstreamRecord::Txt(
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect(),
            ),
            Some(RData::CNAME(cname)) => UpstreamRecord::Name(name_to_string(&cname.0)),
            Some(RData::NS(ns)) => UpstreamRecord::Name(name_to_string(&ns.0)),
            _ => continue,
        };
        let ttl = record.ttl();
        answer.min_ttl = Some(answer.min_ttl.map_or(ttl, |cur| cur.min(ttl)));
        answer.records.push(parsed);
    }
    Ok(answer)
}

fn name_to_string(name: &Name) -> String {
    let s = name.to_utf8();
    s.strip_suffix('.').map(str::to_string).unwrap_or(s)
}
