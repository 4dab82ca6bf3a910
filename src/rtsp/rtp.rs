use std::time::Duration;

use bytes::{Buf, Bytes};

use super::depacketizer::DepacketizeError;
use crate::core::ticks_to_duration;

const RTP_VERSION: u8 = 2;
const FIXED_HEADER_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(mut buf: Bytes) -> Result<Self, DepacketizeError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(DepacketizeError::MalformedRtp("shorter than fixed header"));
        }

        let b0 = buf[0];
        if b0 >> 6 != RTP_VERSION {
            return Err(DepacketizeError::MalformedRtp("unsupported version"));
        }
        let padding = b0 & 0x20 != 0;
        let extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0F) as usize;

        let b1 = buf[1];
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7F;

        buf.advance(2);
        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.len() < csrc_count * 4 {
            return Err(DepacketizeError::MalformedRtp("truncated CSRC list"));
        }
        buf.advance(csrc_count * 4);

        if extension {
            if buf.len() < 4 {
                return Err(DepacketizeError::MalformedRtp("truncated extension header"));
            }
            buf.advance(2);
            let words = buf.get_u16() as usize;
            if buf.len() < words * 4 {
                return Err(DepacketizeError::MalformedRtp("truncated extension"));
            }
            buf.advance(words * 4);
        }

        if padding {
            let pad = buf.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > buf.len() {
                return Err(DepacketizeError::MalformedRtp("bad padding"));
            }
            buf.truncate(buf.len() - pad);
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: buf,
        })
    }
}

/// Turns 32-bit RTP timestamps into a presentation time relative to the
/// first packet, following wraparound in either direction.
#[derive(Debug, Default)]
pub struct TimestampUnwrapper {
    last: Option<u32>,
    elapsed: i64,
}

impl TimestampUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, ts: u32) -> Duration {
        if let Some(last) = self.last {
            self.elapsed += ts.wrapping_sub(last) as i32 as i64;
        }
        self.last = Some(ts);
        ticks_to_duration(self.elapsed.max(0) as u64)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use bytes::{BufMut, Bytes, BytesMut};

    pub fn build_rtp(pt: u8, marker: bool, seq: u16, ts: u32, payload: &[u8]) -> Bytes {
        let mut b = BytesMut::with_capacity(12 + payload.len());
        b.put_u8(0x80);
        b.put_u8(if marker { 0x80 | pt } else { pt });
        b.put_u16(seq);
        b.put_u32(ts);
        b.put_u32(0x1234_5678);
        b.put_slice(payload);
        b.freeze()
    }
}
