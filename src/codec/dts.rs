//! Decode-timestamp extraction for H.264 access units.
//!
//! RTP only carries presentation time. When a stream uses B-frames the
//! container also needs a decode time that is monotonic and never later than
//! the presentation time. The extractor derives it from the picture order
//! count: it learns how far display order runs ahead of (or behind) decode
//! order and delays the decode timeline by that many frame intervals.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use super::NaluType;
use super::bits::BitError;
use super::sps::{Sps, slice_poc_lsb};

const MAX_REORDER_DEPTH: i64 = 16;
const MIN_DTS_STEP: Duration = Duration::from_millis(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DtsError {
    #[error("no SPS received yet")]
    MissingSps,
    #[error("invalid SPS: {0}")]
    Sps(BitError),
    #[error("invalid slice header: {0}")]
    Slice(BitError),
    #[error("access unit carries no picture slice")]
    NoSlice,
    #[error("POC type {0} is not supported")]
    UnsupportedPocType(u32),
    #[error("reorder depth {0} exceeds the supported maximum")]
    TooManyReordered(i64),
    #[error("DTS {dts:?} is greater than PTS {pts:?}")]
    DtsAfterPts { dts: Duration, pts: Duration },
}

#[derive(Debug, Default)]
pub struct DtsExtractor {
    sps: Option<Sps>,
    prev_dts: Option<Duration>,
    idr_pts: Duration,
    decode_index: i64,
    poc_msb: i64,
    prev_poc_lsb: u32,
    poc_step: i64,
    reorder_depth: i64,
    frame_interval_ns: i64,
}

impl DtsExtractor {
    pub fn new() -> Self {
        Self {
            poc_step: 2,
            ..Default::default()
        }
    }

    pub fn extract(&mut self, au: &[Bytes], pts: Duration) -> Result<Duration, DtsError> {
        let mut slice: Option<&Bytes> = None;
        for nalu in au {
            match NaluType::of(nalu) {
                NaluType::Sps => self.sps = Some(Sps::parse(nalu).map_err(DtsError::Sps)?),
                NaluType::Idr | NaluType::NonIdr if slice.is_none() => slice = Some(nalu),
                _ => {}
            }
        }
        let slice = slice.ok_or(DtsError::NoSlice)?;
        let sps = self.sps.as_ref().ok_or(DtsError::MissingSps)?;

        let candidate = match sps.pic_order_cnt_type {
            2 => pts,
            0 => {
                let idr = NaluType::of(slice) == NaluType::Idr;
                let lsb = slice_poc_lsb(slice, sps).map_err(DtsError::Slice)?;
                let max_lsb = 1i64 << sps.log2_max_poc_lsb;
                self.poc_candidate(idr, lsb, max_lsb, pts)?
            }
            other => return Err(DtsError::UnsupportedPocType(other)),
        };

        let dts = match self.prev_dts {
            Some(prev) if candidate <= prev => prev + MIN_DTS_STEP,
            _ => candidate,
        };
        if dts > pts {
            return Err(DtsError::DtsAfterPts { dts, pts });
        }

        self.prev_dts = Some(dts);
        Ok(dts)
    }

    fn poc_candidate(
        &mut self,
        idr: bool,
        lsb: u32,
        max_lsb: i64,
        pts: Duration,
    ) -> Result<Duration, DtsError> {
        if idr {
            self.idr_pts = pts;
            self.decode_index = 0;
            self.poc_msb = 0;
            self.prev_poc_lsb = lsb;
            return Ok(self.shifted(0));
        }

        self.decode_index += 1;

        // unwrap the lsb relative to the previous picture
        let prev = self.prev_poc_lsb as i64;
        let cur = lsb as i64;
        if cur < prev && prev - cur >= max_lsb / 2 {
            self.poc_msb += max_lsb;
        } else if cur > prev && cur - prev > max_lsb / 2 {
            self.poc_msb -= max_lsb;
        }
        self.prev_poc_lsb = lsb;
        let poc = self.poc_msb + cur;

        if poc % 2 != 0 {
            self.poc_step = 1;
        }
        let display = poc / self.poc_step;

        if display > 0 && pts > self.idr_pts {
            self.frame_interval_ns = nanos(pts - self.idr_pts) / display;
        }

        let ahead = display - self.decode_index;
        let behind = self.decode_index - display;
        let depth = self.reorder_depth.max(ahead).max(behind);
        if depth > MAX_REORDER_DEPTH {
            return Err(DtsError::TooManyReordered(depth));
        }
        self.reorder_depth = depth;

        Ok(self.shifted(self.decode_index))
    }

    /// `idr_pts + (index - reorder_depth) * interval`, clamped at zero.
    fn shifted(&self, index: i64) -> Duration {
        let offset = (index - self.reorder_depth) * self.frame_interval_ns;
        let ns = nanos(self.idr_pts) + offset;
        Duration::from_nanos(ns.max(0) as u64)
    }
}

fn nanos(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}
