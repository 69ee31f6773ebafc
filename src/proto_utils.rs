use bytes::{BufMut, BytesMut};

use crate::error::NameError;

pub const HEADER_LEN: usize = 12;
pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;
/// Pointer hops tolerated while decoding one name; more is treated as a loop.
pub const MAX_POINTER_HOPS: usize = 10;

const POINTER_MASK: u8 = 0xC0;

/// Header and first question of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub tx_id: u16,
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Transaction ID of a possibly broken packet, 0 when not even that survived.
#[inline]
pub fn transaction_id(packet: &[u8]) -> u16 {
    match packet {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

/// Decodes the header and the first question.
pub fn parse_query(packet: &[u8]) -> Result<Query, NameError> {
    if packet.len() < HEADER_LEN {
        return Err(NameError::HeaderTooShort(packet.len()));
    }

    let tx_id = transaction_id(packet);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return Err(NameError::NoQuestion);
    }

    let (qname, consumed) = parse_domain_name(packet, HEADER_LEN)?;
    let pos = HEADER_LEN + consumed;
    if packet.len() < pos + 4 {
        return Err(NameError::Truncated);
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);

    Ok(Query {
        tx_id,
        qname,
        qtype,
        qclass,
    })
}

/// Decodes the name starting at `offset` of the full message `buf`.
///
/// Returns the dotted name and the number of bytes the name occupies at
/// `offset`. When a compression pointer is followed, only the bytes up to and
/// including that first pointer count as consumed.
pub fn parse_domain_name(buf: &[u8], offset: usize) -> Result<(String, usize), NameError> {
    let mut name = String::new();
    // Presentation length from wire label bytes: labels plus separating dots.
    let mut name_len = 0usize;
    let mut pos = offset;
    let mut consumed: Option<usize> = None;
    let mut hops = 0;

    loop {
        let Some(&len) = buf.get(pos) else {
            return Err(NameError::Truncated);
        };

        if len & POINTER_MASK == POINTER_MASK {
            let Some(&low) = buf.get(pos + 1) else {
                return Err(NameError::Truncated);
            };
            let target = (((len & !POINTER_MASK) as usize) << 8) | low as usize;
            if target >= buf.len() {
                return Err(NameError::PointerOutOfRange(target));
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(NameError::TooManyPointers);
            }
            if consumed.is_none() {
                consumed = Some(pos + 2 - offset);
            }
            pos = target;
            continue;
        }

        if len == 0 {
            // After a pointer `pos` may sit before `offset`; only the
            // pointer-free case measures from here.
            let consumed = match consumed {
                Some(c) => c,
                None => pos + 1 - offset,
            };
            return Ok((name, consumed));
        }

        // 0x40 and 0x80 prefixes are not pointers and land here as lengths >= 64.
        let label_len = len as usize;
        if label_len > MAX_LABEL_LEN {
            return Err(NameError::LabelTooLong(label_len));
        }
        let start = pos + 1;
        let end = start + label_len;
        if end > buf.len() {
            return Err(NameError::Truncated);
        }

        let dot = usize::from(name_len > 0);
        name_len += dot + label_len;
        if name_len > MAX_NAME_LEN {
            return Err(NameError::NameTooLong);
        }
        // Labels must survive a decode/encode round trip unchanged.
        let label = std::str::from_utf8(&buf[start..end]).map_err(|_| NameError::InvalidLabel)?;
        if label.contains('.') {
            return Err(NameError::InvalidLabel);
        }
        if dot == 1 {
            name.push('.');
        }
        name.push_str(label);
        pos = end;
    }
}

/// Encodes `domain` as uncompressed length-prefixed labels.
pub fn write_domain_name(domain: &str) -> Result<Vec<u8>, NameError> {
    let mut out = BytesMut::with_capacity(domain.len() + 2);
    put_domain_name(&mut out, domain)?;
    Ok(out.to_vec())
}

/// Appends the wire form of `domain` to `out`. Nothing is written on error.
pub fn put_domain_name(out: &mut BytesMut, domain: &str) -> Result<(), NameError> {
    let domain = check_domain_name(domain)?;
    for label in domain.split('.') {
        out.put_u8(label.len() as u8);
        out.put_slice(label.as_bytes());
    }
    out.put_u8(0);
    Ok(())
}

/// Syntax check shared by the encoder and record validation. Returns the name
/// without its trailing dot.
pub fn check_domain_name(domain: &str) -> Result<&str, NameError> {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.is_empty() {
        return Err(NameError::EmptyName);
    }
    if domain.len() > MAX_NAME_LEN {
        return Err(NameError::NameTooLong);
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(NameError::EmptyLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(NameError::LabelTooLong(label.len()));
        }
    }
    Ok(domain)
}

#[cfg(test)]
pub(crate) fn build_query_packet(tx_id: u16, qname: &str, qtype: u16) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + qname.len() + 6);
    out.put_u16(tx_id);
    out.put_u16(0x0100);
    out.put_u16(1);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    put_domain_name(&mut out, qname).expect("test qname");
    out.put_u16(qtype);
    out.put_u16(1);
    out.to_vec()
}
