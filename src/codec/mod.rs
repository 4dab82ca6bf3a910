//! H.264 elementary-stream helpers.
//!
//! NAL units are handled without start codes (`Bytes` per unit); Annex-B
//! framing is only added when writing to the container or handing frames to
//! consumers.

pub mod bits;
pub mod dts;
pub mod sps;

use bytes::{BufMut, Bytes, BytesMut};

/// An access unit: the NAL units of one picture in arrival order.
pub type AccessUnit = Vec<Bytes>;

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Access unit delimiter, `primary_pic_type = 7` (any slice type).
pub const AUD_NALU: [u8; 2] = [0x09, 0xF0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    NonIdr,
    Idr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    Other(u8),
}

impl NaluType {
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NaluType::NonIdr,
            5 => NaluType::Idr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::AccessUnitDelimiter,
            other => NaluType::Other(other),
        }
    }

    /// Type of a NAL unit; empty units map to `Other(0)`.
    pub fn of(nalu: &[u8]) -> Self {
        nalu.first()
            .map(|b| Self::from_header(*b))
            .unwrap_or(NaluType::Other(0))
    }
}

pub fn idr_present(au: &[Bytes]) -> bool {
    au.iter().any(|n| NaluType::of(n) == NaluType::Idr)
}

/// Joins NAL units into one Annex-B buffer.
pub fn to_annex_b(au: &[Bytes]) -> Bytes {
    let len: usize = au.iter().map(|n| n.len() + START_CODE.len()).sum();
    let mut out = BytesMut::with_capacity(len);
    for nalu in au {
        out.put_slice(&START_CODE);
        out.put_slice(nalu);
    }
    out.freeze()
}

/// Splits an Annex-B buffer (3- or 4-byte start codes) into NAL units.
pub fn split_annex_b(buf: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            if let Some(s) = start {
                let mut end = i;
                // a 4-byte start code leaves one zero behind
                if end > s && buf[end - 1] == 0 {
                    end -= 1;
                }
                units.push(&buf[s..end]);
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        if s < buf.len() {
            units.push(&buf[s..]);
        }
    }
    units
}
