//! RTP → H.264 access units (single NAL unit, STAP-A and FU-A packetization).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::rtp::RtpPacket;
use crate::codec::AccessUnit;

const STAP_A: u8 = 24;
const FU_A: u8 = 28;
const MAX_AU_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DepacketizeError {
    #[error("more packets are needed to complete the access unit")]
    MorePacketsNeeded,
    #[error("received a non-starting fragment without any previous starting fragment")]
    NonStartingPacketAndNoPrevious,
    #[error("malformed RTP packet: {0}")]
    MalformedRtp(&'static str),
    #[error("malformed H264 payload: {0}")]
    MalformedPayload(&'static str),
    #[error("packetization type {0} is not supported")]
    UnsupportedPacketization(u8),
    #[error("sequence gap inside a fragmented unit: expected {expected}, got {got}")]
    FragmentGap { expected: u16, got: u16 },
    #[error("access unit exceeds {0} bytes")]
    TooLarge(usize),
}

impl DepacketizeError {
    /// Errors that are part of normal operation and not worth reporting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DepacketizeError::MorePacketsNeeded | DepacketizeError::NonStartingPacketAndNoPrevious
        )
    }
}

#[derive(Debug, Default)]
pub struct H264Depacketizer {
    fragment: Option<BytesMut>,
    next_fragment_seq: u16,
    pending: AccessUnit,
    pending_size: usize,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one packet; returns an access unit once the packet carrying the
    /// marker bit completes it.
    pub fn push(&mut self, pkt: &RtpPacket) -> Result<AccessUnit, DepacketizeError> {
        let payload = &pkt.payload;
        let Some(&indicator) = payload.first() else {
            return Err(DepacketizeError::MalformedPayload("empty payload"));
        };

        match indicator & 0x1F {
            FU_A => {
                let Some(nalu) = self.push_fragment(pkt)? else {
                    return Err(DepacketizeError::MorePacketsNeeded);
                };
                self.append(nalu)?;
            }
            STAP_A => {
                self.fragment = None;
                for nalu in split_stap_a(payload)? {
                    self.append(nalu)?;
                }
            }
            1..=23 => {
                self.fragment = None;
                self.append(payload.clone())?;
            }
            other => {
                self.fragment = None;
                return Err(DepacketizeError::UnsupportedPacketization(other));
            }
        }

        if !pkt.marker {
            return Err(DepacketizeError::MorePacketsNeeded);
        }
        self.pending_size = 0;
        Ok(std::mem::take(&mut self.pending))
    }

    fn push_fragment(&mut self, pkt: &RtpPacket) -> Result<Option<Bytes>, DepacketizeError> {
        let payload = &pkt.payload;
        if payload.len() < 3 {
            self.fragment = None;
            return Err(DepacketizeError::MalformedPayload("FU-A shorter than 3 bytes"));
        }
        let header = payload[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;

        if start {
            if end {
                self.fragment = None;
                return Err(DepacketizeError::MalformedPayload("FU-A with start and end bits"));
            }
            let mut buf = BytesMut::with_capacity(payload.len() * 8);
            buf.put_u8((payload[0] & 0xE0) | (header & 0x1F));
            buf.put_slice(&payload[2..]);
            self.fragment = Some(buf);
            self.next_fragment_seq = pkt.sequence.wrapping_add(1);
            return Ok(None);
        }

        let Some(buf) = self.fragment.as_mut() else {
            return Err(DepacketizeError::NonStartingPacketAndNoPrevious);
        };
        if pkt.sequence != self.next_fragment_seq {
            let expected = self.next_fragment_seq;
            self.fragment = None;
            self.pending.clear();
            self.pending_size = 0;
            return Err(DepacketizeError::FragmentGap {
                expected,
                got: pkt.sequence,
            });
        }
        if buf.len() + payload.len() > MAX_AU_SIZE {
            self.fragment = None;
            return Err(DepacketizeError::TooLarge(MAX_AU_SIZE));
        }
        buf.put_slice(&payload[2..]);
        self.next_fragment_seq = pkt.sequence.wrapping_add(1);

        if !end {
            return Ok(None);
        }
        Ok(self.fragment.take().map(BytesMut::freeze))
    }

    fn append(&mut self, nalu: Bytes) -> Result<(), DepacketizeError> {
        self.pending_size += nalu.len();
        if self.pending_size > MAX_AU_SIZE {
            self.pending.clear();
            self.pending_size = 0;
            return Err(DepacketizeError::TooLarge(MAX_AU_SIZE));
        }
        self.pending.push(nalu);
        Ok(())
    }
}

fn split_stap_a(payload: &Bytes) -> Result<Vec<Bytes>, DepacketizeError> {
    let mut rest = payload.slice(1..);
    let mut units = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(DepacketizeError::MalformedPayload("truncated STAP-A size"));
        }
        let size = rest.get_u16() as usize;
        if size == 0 || size > rest.len() {
            return Err(DepacketizeError::MalformedPayload("bad STAP-A unit size"));
        }
        units.push(rest.split_to(size));
    }
    if units.is_empty() {
        return Err(DepacketizeError::MalformedPayload("empty STAP-A"));
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtsp::rtp::testutil::build_rtp;

    fn packet(marker: bool, seq: u16, payload: &[u8]) -> RtpPacket {
        RtpPacket::parse(build_rtp(96, marker, seq, 9000, payload)).unwrap()
    }

    #[test]
    fn test_single_nal_units_collect_until_marker() {
        let mut d = H264Depacketizer::new();
        assert_eq!(
            d.push(&packet(false, 1, &[0x67, 0x42])),
            Err(DepacketizeError::MorePacketsNeeded)
        );
        assert_eq!(
            d.push(&packet(false, 2, &[0x68, 0xCE])),
            Err(DepacketizeError::MorePacketsNeeded)
        );
        let au = d.push(&packet(true, 3, &[0x65, 0x88, 0x84])).unwrap();
        assert_eq!(au.len(), 3);
        assert_eq!(&au[2][..], &[0x65, 0x88, 0x84]);

        let next = d.push(&packet(true, 4, &[0x41, 0x9A])).unwrap();
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn test_stap_a() {
        let mut d = H264Depacketizer::new();
        let payload = [
            0x18, // STAP-A
            0x00, 0x02, 0x67, 0x42, //
            0x00, 0x02, 0x68, 0xCE, //
            0x00, 0x03, 0x65, 0x88, 0x84,
        ];
        let au = d.push(&packet(true, 1, &payload)).unwrap();
        assert_eq!(au.len(), 3);
        assert_eq!(&au[0][..], &[0x67, 0x42]);
        assert_eq!(&au[1][..], &[0x68, 0xCE]);
        assert_eq!(&au[2][..], &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_fu_a_reassembly() {
        let mut d = H264Depacketizer::new();
        // NRI 3, type 5 split over three fragments
        assert_eq!(
            d.push(&packet(false, 10, &[0x7C, 0x85, 1, 2])),
            Err(DepacketizeError::MorePacketsNeeded)
        );
        assert_eq!(
            d.push(&packet(false, 11, &[0x7C, 0x05, 3, 4])),
            Err(DepacketizeError::MorePacketsNeeded)
        );
        let au = d.push(&packet(true, 12, &[0x7C, 0x45, 5])).unwrap();
        assert_eq!(au.len(), 1);
        assert_eq!(&au[0][..], &[0x65, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_fu_a_continuation_without_start() {
        let mut d = H264Depacketizer::new();
        let err = d.push(&packet(false, 5, &[0x7C, 0x05, 3, 4])).unwrap_err();
        assert_eq!(err, DepacketizeError::NonStartingPacketAndNoPrevious);
        assert!(err.is_transient());
    }

    #[test]
    fn test_fu_a_gap_drops_fragment() {
        let mut d = H264Depacketizer::new();
        let _ = d.push(&packet(false, 10, &[0x7C, 0x85, 1, 2]));
        let err = d.push(&packet(false, 12, &[0x7C, 0x05, 3, 4])).unwrap_err();
        assert_eq!(err, DepacketizeError::FragmentGap { expected: 11, got: 12 });
        assert!(!err.is_transient());

        // the tail of the broken unit has no start any more
        assert_eq!(
            d.push(&packet(true, 13, &[0x7C, 0x45, 5])),
            Err(DepacketizeError::NonStartingPacketAndNoPrevious)
        );
    }

    #[test]
    fn test_unsupported_types() {
        let mut d = H264Depacketizer::new();
        assert_eq!(
            d.push(&packet(true, 1, &[0x19, 0, 0])),
            Err(DepacketizeError::UnsupportedPacketization(25))
        );
        assert_eq!(
            d.push(&packet(true, 2, &[])),
            Err(DepacketizeError::MalformedPayload("empty payload"))
        );
    }
}
