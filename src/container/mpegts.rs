use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};

pub const TS_PACKET_SIZE: usize = 188;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_ID_VIDEO: u8 = 0xE0;
const PROGRAM_NUMBER: u16 = 1;

const TIMESTAMP_MASK: u64 = 0x1_FFFF_FFFF;

/// Single-program transport stream writer carrying one H.264 track.
///
/// Every access unit becomes one PES packet. PAT and PMT are written before
/// the first unit and again before every random-access unit, so each chunk
/// that starts on a key frame is decodable on its own.
pub struct TsWriter<W: Write> {
    out: W,
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    tables_written: bool,
    packet: [u8; TS_PACKET_SIZE],
}

impl<W: Write> TsWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
            tables_written: false,
            packet: [0xFF; TS_PACKET_SIZE],
        }
    }

    /// Writes one Annex-B access unit. `pts` and `dts` are 90 kHz ticks.
    pub fn write_access_unit(
        &mut self,
        pts: u64,
        dts: u64,
        random_access: bool,
        annexb: &[u8],
    ) -> io::Result<()> {
        if random_access || !self.tables_written {
            self.write_tables()?;
        }

        let pes = build_pes(pts & TIMESTAMP_MASK, dts & TIMESTAMP_MASK, annexb)?;
        let mut rest = &pes[..];
        let mut first = true;

        while !rest.is_empty() {
            let mut af = Vec::new();
            if first {
                let mut flags = 0x10; // PCR
                if random_access {
                    flags |= 0x40;
                }
                af.push(flags);
                af.extend_from_slice(&encode_pcr(dts & TIMESTAMP_MASK));
            }
            let taken = self.write_payload_packet(first, af, rest)?;
            rest = &rest[taken..];
            first = false;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_tables(&mut self) -> io::Result<()> {
        let pat = pat_section();
        let cc = next_cc(&mut self.pat_cc);
        self.write_section_packet(PAT_PID, cc, &pat)?;

        let pmt = pmt_section();
        let cc = next_cc(&mut self.pmt_cc);
        self.write_section_packet(PMT_PID, cc, &pmt)?;

        self.tables_written = true;
        Ok(())
    }

    fn write_section_packet(&mut self, pid: u16, cc: u8, section: &[u8]) -> io::Result<()> {
        let p = &mut self.packet;
        p.fill(0xFF);
        p[0] = SYNC_BYTE;
        p[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        p[2] = pid as u8;
        p[3] = 0x10 | cc;
        p[4] = 0x00; // pointer_field
        p[5..5 + section.len()].copy_from_slice(section);
        self.out.write_all(&self.packet)
    }

    /// Writes one video packet, stuffing through the adaptation field when the
    /// payload does not fill it. Returns the number of payload bytes consumed.
    fn write_payload_packet(
        &mut self,
        unit_start: bool,
        mut af: Vec<u8>,
        payload: &[u8],
    ) -> io::Result<usize> {
        let mut has_af = !af.is_empty();
        let room = TS_PAYLOAD_SIZE - if has_af { 1 + af.len() } else { 0 };
        let take = payload.len().min(room);
        let mut stuffing = room - take;

        if stuffing > 0 {
            if !has_af {
                has_af = true;
                stuffing -= 1; // adaptation_field_length
                if stuffing > 0 {
                    af.push(0x00);
                    stuffing -= 1;
                }
            }
            af.resize(af.len() + stuffing, 0xFF);
        }

        let cc = next_cc(&mut self.video_cc);
        let p = &mut self.packet;
        p[0] = SYNC_BYTE;
        p[1] = (if unit_start { 0x40 } else { 0x00 }) | ((VIDEO_PID >> 8) as u8 & 0x1F);
        p[2] = VIDEO_PID as u8;
        p[3] = (if has_af { 0x30 } else { 0x10 }) | cc;

        let mut pos = 4;
        if has_af {
            p[pos] = af.len() as u8;
            pos += 1;
            p[pos..pos + af.len()].copy_from_slice(&af);
            pos += af.len();
        }
        p[pos..pos + take].copy_from_slice(&payload[..take]);
        debug_assert_eq!(pos + take, TS_PACKET_SIZE);

        self.out.write_all(&self.packet)?;
        Ok(take)
    }
}

fn next_cc(cc: &mut u8) -> u8 {
    let cur = *cc;
    *cc = (*cc + 1) & 0x0F;
    cur
}

fn build_pes(pts: u64, dts: u64, data: &[u8]) -> io::Result<Vec<u8>> {
    let with_dts = pts != dts;
    let header_len: u8 = if with_dts { 10 } else { 5 };
    let after_length = 3 + header_len as usize + data.len();

    let mut pes = Vec::with_capacity(6 + after_length);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, STREAM_ID_VIDEO]);
    // zero means unbounded, allowed for video
    let length = if after_length > u16::MAX as usize {
        0
    } else {
        after_length as u16
    };
    pes.write_u16::<BigEndian>(length)?;
    pes.push(0x80); // marker bits
    pes.push(if with_dts { 0xC0 } else { 0x80 });
    pes.push(header_len);
    if with_dts {
        put_timestamp(&mut pes, 0x3, pts);
        put_timestamp(&mut pes, 0x1, dts);
    } else {
        put_timestamp(&mut pes, 0x2, pts);
    }
    pes.extend_from_slice(data);
    Ok(pes)
}

fn put_timestamp(buf: &mut Vec<u8>, prefix: u8, ts: u64) {
    buf.push((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1);
    buf.push((ts >> 22) as u8);
    buf.push(((((ts >> 15) & 0x7F) as u8) << 1) | 1);
    buf.push((ts >> 7) as u8);
    buf.push((((ts & 0x7F) as u8) << 1) | 1);
}

/// 33-bit base, 6 reserved bits, 9-bit extension (always zero).
fn encode_pcr(base: u64) -> [u8; 6] {
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) as u8) << 7) | 0x7E,
        0x00,
    ]
}

fn pat_section() -> Vec<u8> {
    let mut s = vec![0x00, 0xB0, 13];
    s.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
    s.extend_from_slice(&[0xC1, 0x00, 0x00]);
    s.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    s.push(0xE0 | (PMT_PID >> 8) as u8);
    s.push(PMT_PID as u8);
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

fn pmt_section() -> Vec<u8> {
    let mut s = vec![0x02, 0xB0, 18];
    s.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
    s.extend_from_slice(&[0xC1, 0x00, 0x00]);
    s.push(0xE0 | (VIDEO_PID >> 8) as u8); // PCR PID
    s.push(VIDEO_PID as u8);
    s.extend_from_slice(&[0xF0, 0x00]); // program_info_length
    s.push(STREAM_TYPE_H264);
    s.push(0xE0 | (VIDEO_PID >> 8) as u8);
    s.push(VIDEO_PID as u8);
    s.extend_from_slice(&[0xF0, 0x00]); // ES_info_length
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

/// CRC-32/MPEG-2: poly 0x04C11DB7, init all ones, not reflected, no final xor.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
