use std::time::Duration;

use hickory_proto::op::ResponseCode;
use thiserror::Error;

use crate::records::RecordKind;

/// Wire-level name and header failures. Raised while decoding a request and
/// while encoding names into a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("message shorter than the 12-byte header ({0} bytes)")]
    HeaderTooShort(usize),

    #[error("message carries no question")]
    NoQuestion,

    #[error("buffer ends inside a name")]
    Truncated,

    #[error("label length {0} exceeds 63")]
    LabelTooLong(usize),

    #[error("domain name exceeds 255 bytes")]
    NameTooLong,

    #[error("compression pointer to {0} is outside the message")]
    PointerOutOfRange(usize),

    #[error("too many compression pointers")]
    TooManyPointers,

    #[error("empty domain name")]
    EmptyName,

    #[error("empty label in domain name")]
    EmptyLabel,

    #[error("label holds a dot or non-UTF-8 bytes")]
    InvalidLabel,
}

/// A resolved value that does not fit the record type it was produced for.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("{kind} record cannot carry {found} data")]
    WrongShape {
        kind: RecordKind,
        found: &'static str,
    },

    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4(String),

    #[error("invalid IPv6 address: {0}")]
    InvalidIpv6(String),

    #[error("invalid domain {domain:?}: {source}")]
    InvalidDomain { domain: String, source: NameError },

    #[error("TXT record needs at least one string")]
    EmptyText,

    #[error("TXT string of {0} bytes exceeds 255")]
    TextTooLong(usize),

    #[error("record data of {0} bytes does not fit RDLENGTH")]
    RdataTooLong(usize),
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream protocol: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("upstream answered {0}")]
    Rcode(ResponseCode),
}

/// What the request pipeline does with a failed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Answer with a server-failure header.
    ServFail,
    /// Send nothing back.
    Drop,
}

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("malformed request: {0}")]
    Malformed(NameError),

    #[error("unsupported query type {0}")]
    UnsupportedType(u16),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("request has no usable source address")]
    MissingSourceIdentity,

    #[error("resolution failed: {0}")]
    Resolution(#[from] UpstreamError),

    #[error("upstream returned no usable records")]
    NoRecords,

    #[error("resolved value rejected: {0}")]
    Validation(#[from] RecordError),

    #[error("cannot encode reply: {0}")]
    Encode(NameError),
}

impl DnsError {
    /// Rate-limited and anonymous sources are dropped so a flood is never
    /// amplified; everything else gets a server-failure reply.
    pub fn reply_policy(&self) -> ReplyPolicy {
        match self {
            DnsError::RateLimited | DnsError::MissingSourceIdentity => ReplyPolicy::Drop,
            _ => ReplyPolicy::ServFail,
        }
    }

    /// Stable label for log fields and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            DnsError::Malformed(_) => "malformed_request",
            DnsError::UnsupportedType(_) => "unsupported_type",
            DnsError::RateLimited => "rate_limited",
            DnsError::MissingSourceIdentity => "missing_source_identity",
            DnsError::Resolution(_) => "resolution_failure",
            DnsError::NoRecords => "no_records",
            DnsError::Validation(_) => "validation_failure",
            DnsError::Encode(_) => "encode_failure",
        }
    }
}
