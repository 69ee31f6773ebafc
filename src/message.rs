use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DnsError;
use crate::proto_utils::{HEADER_LEN, put_domain_name};
use crate::records::{Owner, RecordData, RecordKind};

/// QR, RD and RA set, NOERROR.
pub const FLAGS_SUCCESS: u16 = 0x8180;
/// QR, RD and RA set, SERVFAIL.
pub const FLAGS_SERVFAIL: u16 = 0x8182;

/// Single-question, single-answer reply. The answer owner is a compression
/// pointer back to the question name at offset 12.
pub fn build_response(
    tx_id: u16,
    flags: u16,
    qname: &str,
    kind: RecordKind,
    data: &RecordData,
    ttl: u32,
) -> Result<Bytes, DnsError> {
    let mut out = BytesMut::with_capacity(512);
    put_header(&mut out, tx_id, flags, 1, 1);

    put_domain_name(&mut out, qname).map_err(DnsError::Encode)?;
    out.put_u16(kind.code());
    out.put_u16(kind.class_code());

    kind.build_answer(Owner::Pointer(HEADER_LEN as u16), data, ttl, &mut out)?;
    Ok(out.freeze())
}

/// Header-only SERVFAIL echoing `tx_id`.
pub fn build_error_response(tx_id: u16) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut out, tx_id, FLAGS_SERVFAIL, 0, 0);
    out.freeze()
}

#[inline]
fn put_header(out: &mut BytesMut, tx_id: u16, flags: u16, qd_count: u16, an_count: u16) {
    out.put_u16(tx_id);
    out.put_u16(flags);
    out.put_u16(qd_count);
    out.put_u16(an_count);
    out.put_u16(0); // NSCOUNT
    out.put_u16(0); // ARCOUNT
}
