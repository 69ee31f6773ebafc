use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;

use crate::error::{NameError, RecordError};
use crate::proto_utils::{check_domain_name, put_domain_name};

pub const CLASS_IN: u16 = 1;
pub const DEFAULT_TTL: u32 = 300;
const MAX_TXT_STRING: usize = 255;

/// Answer value handed from the resolver to the reply builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// Address literal for A and AAAA.
    Address(String),
    Mail { preference: u16, exchange: String },
    Text(Vec<String>),
    /// Target name for CNAME and NS.
    Domain(String),
}

impl RecordData {
    fn shape(&self) -> &'static str {
        match self {
            RecordData::Address(_) => "address",
            RecordData::Mail { .. } => "mail exchange",
            RecordData::Text(_) => "text",
            RecordData::Domain(_) => "domain",
        }
    }
}

impl fmt::Display for RecordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordData::Address(ip) => f.write_str(ip),
            RecordData::Mail {
                preference,
                exchange,
            } => write!(f, "{preference} {exchange}"),
            RecordData::Text(parts) => write!(f, "{parts:?}"),
            RecordData::Domain(name) => f.write_str(name),
        }
    }
}

/// The supported record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Aaaa,
    Mx,
    Txt,
    Cname,
    Ns,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        RecordKind::A,
        RecordKind::Aaaa,
        RecordKind::Mx,
        RecordKind::Txt,
        RecordKind::Cname,
        RecordKind::Ns,
    ];

    #[inline]
    pub fn code(self) -> u16 {
        match self {
            RecordKind::A => 1,
            RecordKind::Ns => 2,
            RecordKind::Cname => 5,
            RecordKind::Mx => 15,
            RecordKind::Txt => 16,
            RecordKind::Aaaa => 28,
        }
    }

    #[inline]
    pub fn class_code(self) -> u16 {
        CLASS_IN
    }

    #[inline]
    pub fn default_ttl(self) -> u32 {
        DEFAULT_TTL
    }

    pub fn validate(self, data: &RecordData) -> Result<(), RecordError> {
        match (self, data) {
            (RecordKind::A, RecordData::Address(ip)) => ip
                .parse::<Ipv4Addr>()
                .map(|_| ())
                .map_err(|_| RecordError::InvalidIpv4(ip.clone())),
            (RecordKind::Aaaa, RecordData::Address(ip)) => match ip.parse::<Ipv6Addr>() {
                Ok(v6) if v6.to_ipv4_mapped().is_none() => Ok(()),
                _ => Err(RecordError::InvalidIpv6(ip.clone())),
            },
            (RecordKind::Mx, RecordData::Mail { exchange, .. }) => validate_domain(exchange),
            (RecordKind::Txt, RecordData::Text(parts)) => {
                if parts.is_empty() {
                    return Err(RecordError::EmptyText);
                }
                match parts.iter().find(|p| p.len() > MAX_TXT_STRING) {
                    Some(long) => Err(RecordError::TextTooLong(long.len())),
                    None => Ok(()),
                }
            }
            (RecordKind::Cname | RecordKind::Ns, RecordData::Domain(target)) => {
                validate_domain(target)
            }
            (kind, other) => Err(RecordError::WrongShape {
                kind,
                found: other.shape(),
            }),
        }
    }

    /// Validates `data` and returns its RDATA.
    pub fn serialize(self, data: &RecordData) -> Result<BytesMut, RecordError> {
        self.validate(data)?;
        let mut rdata = BytesMut::with_capacity(64);
        match data {
            RecordData::Address(ip) => match self {
                RecordKind::A => {
                    let v4: Ipv4Addr = ip
                        .parse()
                        .map_err(|_| RecordError::InvalidIpv4(ip.clone()))?;
                    rdata.put_slice(&v4.octets());
                }
                _ => {
                    let v6: Ipv6Addr = ip
                        .parse()
                        .map_err(|_| RecordError::InvalidIpv6(ip.clone()))?;
                    rdata.put_slice(&v6.octets());
                }
            },
            RecordData::Mail {
                preference,
                exchange,
            } => {
                rdata.put_u16(*preference);
                put_target(&mut rdata, exchange)?;
            }
            RecordData::Text(parts) => {
                for part in parts {
                    rdata.put_u8(part.len() as u8);
                    rdata.put_slice(part.as_bytes());
                }
            }
            RecordData::Domain(target) => put_target(&mut rdata, target)?,
        }
        Ok(rdata)
    }

    /// Writes one answer record to `out`: validate, then owner, type, class,
    /// TTL (default when `ttl` is 0), RDLENGTH and RDATA. `out` is untouched
    /// when validation fails.
    pub fn build_answer(
        self,
        owner: Owner,
        data: &RecordData,
        ttl: u32,
        out: &mut BytesMut,
    ) -> Result<(), RecordError> {
        let rdata = self.serialize(data)?;
        let rd_len =
            u16::try_from(rdata.len()).map_err(|_| RecordError::RdataTooLong(rdata.len()))?;

        let mut record = BytesMut::with_capacity(rdata.len() + 16);
        match owner {
            Owner::Pointer(offset) => record.put_u16(0xC000 | (offset & 0x3FFF)),
            #[cfg(test)]
            Owner::Name(name) => put_target(&mut record, &name)?,
        }
        record.put_u16(self.code());
        record.put_u16(self.class_code());
        record.put_u32(if ttl == 0 { self.default_ttl() } else { ttl });
        record.put_u16(rd_len);
        record.put_slice(&rdata);

        out.put_slice(&record);
        Ok(())
    }

    pub fn from_code(code: u16) -> Option<RecordKind> {
        RecordKind::ALL.into_iter().find(|k| k.code() == code)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::A => "A",
            RecordKind::Aaaa => "AAAA",
            RecordKind::Mx => "MX",
            RecordKind::Txt => "TXT",
            RecordKind::Cname => "CNAME",
            RecordKind::Ns => "NS",
        })
    }
}

/// How an answer names its owner.
#[derive(Debug, Clone)]
pub enum Owner {
    /// Literal owner name; replies always point back at the question instead.
    #[cfg(test)]
    Name(String),
    /// Compression pointer to a name already in the message.
    Pointer(u16),
}

fn validate_domain(domain: &str) -> Result<(), RecordError> {
    check_domain_name(domain)
        .map(|_| ())
        .map_err(|source| invalid_domain(domain, source))
}

fn put_target(out: &mut BytesMut, domain: &str) -> Result<(), RecordError> {
    put_domain_name(out, domain).map_err(|source| invalid_domain(domain, source))
}

fn invalid_domain(domain: &str, source: NameError) -> RecordError {
    RecordError::InvalidDomain {
        domain: domain.to_string(),
        source,
    }
}

/// Type code to handler table, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct RecordRegistry {
    handlers: FxHashMap<u16, RecordKind>,
}

impl RecordRegistry {
    /// All six supported types.
    pub fn standard() -> Self {
        Self::with_kinds(RecordKind::ALL)
    }

    pub fn with_kinds(kinds: impl IntoIterator<Item = RecordKind>) -> Self {
        let handlers = kinds.into_iter().map(|k| (k.code(), k)).collect();
        Self { handlers }
    }

    #[inline]
    pub fn get(&self, code: u16) -> Option<RecordKind> {
        self.handlers.get(&code).copied()
    }

    pub fn kinds(&self) -> impl Iterator<Item = RecordKind> + '_ {
        self.handlers.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> RecordData {
        RecordData::Address(s.to_string())
    }

    fn domain(s: &str) -> RecordData {
        RecordData::Domain(s.to_string())
    }

    #[test]
    fn type_codes_match_wire_values() {
        let codes: Vec<u16> = RecordKind::ALL.iter().map(|k| k.code()).collect();
        assert_eq!(codes, vec![1, 28, 15, 16, 5, 2]);
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_code(kind.code()), Some(kind));
            assert_eq!(kind.class_code(), 1);
            assert_eq!(kind.default_ttl(), 300);
        }
        assert_eq!(RecordKind::from_code(999), None);
    }

    #[test]
    fn address_families_reject_each_other() {
        assert!(RecordKind::A.validate(&addr("192.0.2.1")).is_ok());
        assert_eq!(
            RecordKind::A.validate(&addr("2001:db8::1")),
            Err(RecordError::InvalidIpv4("2001:db8::1".into()))
        );
        assert!(RecordKind::Aaaa.validate(&addr("2001:db8::1")).is_ok());
        assert!(RecordKind::Aaaa.validate(&addr("192.0.2.1")).is_err());
        // IPv4-mapped addresses are IPv4 in disguise.
        assert!(RecordKind::Aaaa.validate(&addr("::ffff:192.0.2.1")).is_err());
        assert!(RecordKind::A.validate(&addr("not-an-ip")).is_err());
    }

    #[test]
    fn txt_rules() {
        let ok = RecordData::Text(vec!["v=spf1 include:_spf.google.com ~all".into()]);
        assert!(RecordKind::Txt.validate(&ok).is_ok());
        assert_eq!(
            RecordKind::Txt.validate(&RecordData::Text(vec![])),
            Err(RecordError::EmptyText)
        );
        let long = RecordData::Text(vec!["ok".into(), "x".repeat(256)]);
        assert_eq!(
            RecordKind::Txt.validate(&long),
            Err(RecordError::TextTooLong(256))
        );
    }

    #[test]
    fn name_bearing_types_reject_bad_domains() {
        for kind in [RecordKind::Cname, RecordKind::Ns] {
            assert!(kind.validate(&domain("example.com")).is_ok());
            assert!(kind.validate(&domain("")).is_err());
            assert!(kind.validate(&domain("a..b")).is_err());
        }
        let bad_mx = RecordData::Mail {
            preference: 10,
            exchange: String::new(),
        };
        assert!(RecordKind::Mx.validate(&bad_mx).is_err());
        let bad_mx = RecordData::Mail {
            preference: 10,
            exchange: "mail..example.com".into(),
        };
        assert!(RecordKind::Mx.validate(&bad_mx).is_err());
    }

    #[test]
    fn wrong_shape_is_rejected() {
        assert_eq!(
            RecordKind::Mx.validate(&domain("mail.example.com")),
            Err(RecordError::WrongShape {
                kind: RecordKind::Mx,
                found: "domain"
            })
        );
        assert!(
            RecordKind::A
                .validate(&RecordData::Text(vec!["1.2.3.4".into()]))
                .is_err()
        );
        assert!(RecordKind::Cname.validate(&addr("1.2.3.4")).is_err());
    }

    #[test]
    fn serializes_rdata_per_type() {
        let a = RecordKind::A.serialize(&addr("192.0.2.1")).expect("a");
        assert_eq!(&a[..], &[192, 0, 2, 1]);

        let aaaa = RecordKind::Aaaa.serialize(&addr("2001:db8::1")).expect("aaaa");
        assert_eq!(aaaa.len(), 16);
        assert_eq!(&aaaa[..2], &[0x20, 0x01]);
        assert_eq!(aaaa[15], 1);

        let mx = RecordKind::Mx
            .serialize(&RecordData::Mail {
                preference: 10,
                exchange: "mail.example.com".into(),
            })
            .expect("mx");
        assert_eq!(&mx[..2], &[0, 10]);
        assert_eq!(&mx[2..], &write_name("mail.example.com")[..]);

        let txt = RecordKind::Txt
            .serialize(&RecordData::Text(vec!["ab".into(), "c".into()]))
            .expect("txt");
        assert_eq!(&txt[..], &[2, b'a', b'b', 1, b'c']);

        let ns = RecordKind::Ns.serialize(&domain("ns1.example.com")).expect("ns");
        assert_eq!(&ns[..], &write_name("ns1.example.com")[..]);
    }

    fn write_name(name: &str) -> Vec<u8> {
        crate::proto_utils::write_domain_name(name).expect("name")
    }

    #[test]
    fn answer_template_uses_default_ttl_and_pointer_owner() {
        let mut out = BytesMut::new();
        RecordKind::A
            .build_answer(Owner::Pointer(12), &addr("192.0.2.1"), 0, &mut out)
            .expect("answer");
        assert_eq!(
            &out[..],
            &[
                0xC0, 0x0C, // owner
                0, 1, // type
                0, 1, // class
                0, 0, 0x01, 0x2C, // ttl 300
                0, 4, // rdlength
                192, 0, 2, 1
            ]
        );

        let mut out = BytesMut::new();
        RecordKind::Cname
            .build_answer(Owner::Name("www.example.com".into()), &domain("example.com"), 60, &mut out)
            .expect("answer");
        let owner = write_name("www.example.com");
        assert_eq!(&out[..owner.len()], &owner[..]);
        let ttl_at = owner.len() + 4;
        assert_eq!(&out[ttl_at..ttl_at + 4], &60u32.to_be_bytes());
    }

    #[test]
    fn answer_template_returns_validation_error_unmodified() {
        let mut out = BytesMut::new();
        let err = RecordKind::A
            .build_answer(Owner::Pointer(12), &addr("2001:db8::1"), 0, &mut out)
            .unwrap_err();
        assert_eq!(err, RecordError::InvalidIpv4("2001:db8::1".into()));
        assert!(out.is_empty());
    }

    #[test]
    fn registry_lookup() {
        let registry = RecordRegistry::standard();
        assert_eq!(registry.kinds().count(), 6);
        assert_eq!(registry.get(15), Some(RecordKind::Mx));
        assert_eq!(registry.get(999), None);

        let only_a = RecordRegistry::with_kinds([RecordKind::A]);
        assert_eq!(only_a.get(1), Some(RecordKind::A));
        assert_eq!(only_a.get(28), None);
    }
}
