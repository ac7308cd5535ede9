//! Product metadata and the in-region record format.
//!
//! A data region holds one product: a fixed info record, the origin and
//! identifier strings, padding to 8 bytes, then the opaque payload. The
//! queue never interprets the payload. The insertion-time field is stamped
//! at commit, while the region is still locked for writing, so later
//! signature-based lookups can find the product's time entry with an
//! exact-match search.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{PqError, Result, corrupt};
use crate::time::Timestamp;

/// 16-byte content fingerprint (by convention the MD5 of the payload).
/// The queue's primary deduplication key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 16]);

impl Signature {
    /// First four bytes, used as the signature-index hash prefix.
    #[inline]
    pub(crate) fn prefix(&self) -> u32 {
        u32::from_ne_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

/// Caller-supplied product metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductInfo {
    /// When the product was created at its source.
    pub create_time: Timestamp,
    /// Content signature; must be unique within the queue.
    pub signature: Signature,
    /// Originating host.
    pub origin: String,
    /// Feed classification bitmask.
    pub feed_type: u32,
    /// Feed-relative sequence number.
    pub seq_no: u32,
    /// Product identifier.
    pub ident: String,
    /// Payload length in bytes.
    pub size: u32,
}

/// Fixed leading record of every in-use data region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InfoRecord {
    pub create_time: Timestamp,
    /// Insertion time; [`Timestamp::NONE`] until commit stamps it.
    pub arrival: Timestamp,
    pub signature: [u8; 16],
    pub feed_type: u32,
    pub seq_no: u32,
    pub size: u32,
    pub origin_len: u16,
    pub ident_len: u16,
}

pub(crate) const INFO_RECORD_SIZE: usize = size_of::<InfoRecord>();

/// Byte offset of the `arrival` field within a region.
pub(crate) const ARRIVAL_OFFSET: usize = size_of::<Timestamp>();

/// Byte offset of the `signature` field within a region.
pub(crate) const SIGNATURE_OFFSET: usize = 2 * size_of::<Timestamp>();

/// Total region bytes needed to encode `info` and its payload.
pub(crate) fn encoded_extent(info: &ProductInfo) -> Result<u64> {
    if info.origin.len() > usize::from(u16::MAX) {
        return Err(PqError::Invalid("origin string too long"));
    }
    if info.ident.len() > usize::from(u16::MAX) {
        return Err(PqError::Invalid("ident string too long"));
    }
    let strings = info.origin.len() + info.ident.len();
    Ok(payload_offset(strings) as u64 + u64::from(info.size))
}

/// Where the payload begins, given the combined string length.
#[inline]
fn payload_offset(strings_len: usize) -> usize {
    (INFO_RECORD_SIZE + strings_len).next_multiple_of(8)
}

/// Write the info record and strings into the head of a region. Returns the
/// payload offset. The arrival field is left unset.
pub(crate) fn encode_into(buf: &mut [u8], info: &ProductInfo) -> Result<usize> {
    let rec = InfoRecord {
        create_time: info.create_time,
        arrival: Timestamp::NONE,
        signature: info.signature.0,
        feed_type: info.feed_type,
        seq_no: info.seq_no,
        size: info.size,
        origin_len: info.origin.len() as u16,
        ident_len: info.ident.len() as u16,
    };
    let data_off = payload_offset(info.origin.len() + info.ident.len());
    if buf.len() < data_off {
        return Err(PqError::Invalid("region too small for metadata"));
    }
    buf[..INFO_RECORD_SIZE].copy_from_slice(bytemuck::bytes_of(&rec));
    let mut at = INFO_RECORD_SIZE;
    buf[at..at + info.origin.len()].copy_from_slice(info.origin.as_bytes());
    at += info.origin.len();
    buf[at..at + info.ident.len()].copy_from_slice(info.ident.as_bytes());
    at += info.ident.len();
    buf[at..data_off].fill(0);
    Ok(data_off)
}

/// Stamp the insertion time into an encoded region.
pub(crate) fn stamp_arrival(buf: &mut [u8], arrival: Timestamp) {
    let range = ARRIVAL_OFFSET..ARRIVAL_OFFSET + size_of::<Timestamp>();
    buf[range].copy_from_slice(bytemuck::bytes_of(&arrival));
}

/// Overwrite the signature in an encoded region (provisional-signature
/// commits).
pub(crate) fn stamp_signature(buf: &mut [u8], sig: &Signature) {
    buf[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 16].copy_from_slice(&sig.0);
}

/// Encode `info` into the head of a caller-supplied buffer laid out the
/// way the queue stores regions, returning the payload offset. For staging
/// products that enter the queue through a direct reservation.
pub fn encode_product(buf: &mut [u8], info: &ProductInfo) -> Result<usize> {
    encode_into(buf, info)
}

/// Decoded view of a region: metadata, insertion time, and payload range.
pub(crate) struct DecodedProduct {
    pub info: ProductInfo,
    pub arrival: Timestamp,
    pub payload_start: usize,
}

/// Decode the product held in `buf` (the full region). Fails `Corrupt` if
/// the recorded lengths do not fit the region.
pub(crate) fn decode(buf: &[u8], offset: u64) -> Result<DecodedProduct> {
    if buf.len() < INFO_RECORD_SIZE {
        return Err(corrupt!(
            "region at {offset:#x} shorter than the info record ({} bytes)",
            buf.len()
        ));
    }
    let rec: InfoRecord = bytemuck::pod_read_unaligned(&buf[..INFO_RECORD_SIZE]);
    let olen = usize::from(rec.origin_len);
    let ilen = usize::from(rec.ident_len);
    let data_off = payload_offset(olen + ilen);
    let total = data_off + rec.size as usize;
    if total > buf.len() {
        return Err(corrupt!(
            "region at {offset:#x}: recorded product needs {total} bytes, region holds {}",
            buf.len()
        ));
    }
    let origin = std::str::from_utf8(&buf[INFO_RECORD_SIZE..INFO_RECORD_SIZE + olen])
        .map_err(|_| corrupt!("region at {offset:#x}: origin is not UTF-8"))?;
    let ident_at = INFO_RECORD_SIZE + olen;
    let ident = std::str::from_utf8(&buf[ident_at..ident_at + ilen])
        .map_err(|_| corrupt!("region at {offset:#x}: ident is not UTF-8"))?;
    Ok(DecodedProduct {
        info: ProductInfo {
            create_time: rec.create_time,
            signature: Signature(rec.signature),
            origin: origin.to_owned(),
            feed_type: rec.feed_type,
            seq_no: rec.seq_no,
            ident: ident.to_owned(),
            size: rec.size,
        },
        arrival: rec.arrival,
        payload_start: data_off,
    })
}

/// Product selector used by sequencing and `last`.
pub enum ClassFilter<'a> {
    /// Match every product.
    All,
    /// Match products whose feed type intersects the mask.
    Feed(u32),
    /// Arbitrary predicate over the metadata.
    Predicate(&'a dyn Fn(&ProductInfo) -> bool),
}

impl ClassFilter<'_> {
    pub fn matches(&self, info: &ProductInfo) -> bool {
        match self {
            ClassFilter::All => true,
            ClassFilter::Feed(mask) => info.feed_type & mask != 0,
            ClassFilter::Predicate(p) => p(info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(size: u32) -> ProductInfo {
        ProductInfo {
            create_time: Timestamp {
                sec: 1_700_000_000,
                usec: 123,
            },
            signature: Signature([0xAB; 16]),
            origin: "ingest.example.edu".into(),
            feed_type: 0x40,
            seq_no: 7,
            ident: "SAUS80 KWBC".into(),
            size,
        }
    }

    #[test]
    fn test_encode_decode() {
        let info = sample_info(11);
        let extent = encoded_extent(&info).unwrap() as usize;
        let mut buf = vec![0u8; extent];
        let data_off = encode_into(&mut buf, &info).unwrap();
        assert_eq!(data_off % 8, 0);
        buf[data_off..].copy_from_slice(b"hello world");

        let when = Timestamp {
            sec: 1_700_000_100,
            usec: 0,
        };
        stamp_arrival(&mut buf, when);

        let d = decode(&buf, 0x1000).unwrap();
        assert_eq!(d.info, info);
        assert_eq!(d.arrival, when);
        assert_eq!(&buf[d.payload_start..], b"hello world");
    }

    #[test]
    fn test_decode_truncated_region_is_corrupt() {
        let info = sample_info(100);
        let extent = encoded_extent(&info).unwrap() as usize;
        let mut buf = vec![0u8; extent];
        encode_into(&mut buf, &info).unwrap();
        // Lop off half the payload; the recorded size no longer fits.
        buf.truncate(extent - 50);
        assert!(matches!(decode(&buf, 0), Err(PqError::Corrupt(_))));
    }

    #[test]
    fn test_stamp_signature() {
        let info = sample_info(1);
        let extent = encoded_extent(&info).unwrap() as usize;
        let mut buf = vec![0u8; extent];
        encode_into(&mut buf, &info).unwrap();
        let real = Signature([0x5A; 16]);
        stamp_signature(&mut buf, &real);
        let d = decode(&buf, 0).unwrap();
        assert_eq!(d.info.signature, real);
    }

    #[test]
    fn test_class_filter() {
        let info = sample_info(1);
        assert!(ClassFilter::All.matches(&info));
        assert!(ClassFilter::Feed(0xF0).matches(&info));
        assert!(!ClassFilter::Feed(0x0F).matches(&info));
        let pred = |i: &ProductInfo| i.ident.starts_with("SAUS");
        assert!(ClassFilter::Predicate(&pred).matches(&info));
    }
}
