//! The subset of SPS and slice-header syntax needed to order pictures.

use super::bits::{BitError, BitReader, unescape_rbsp};
use super::NaluType;

/// Profiles whose SPS carries chroma format and scaling matrices.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// `log2_max_frame_num_minus4` and `log2_max_pic_order_cnt_lsb_minus4` are 0..=12.
const MAX_LOG2_MINUS4: u32 = 12;
const MAX_POC_CYCLE: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub separate_colour_plane: bool,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_poc_lsb: u32,
    pub frame_mbs_only: bool,
    pub width: u32,
    pub height: u32,
}

impl Sps {
    /// Parses a complete SPS NAL unit, header byte included.
    pub fn parse(nalu: &[u8]) -> Result<Self, BitError> {
        let rbsp = unescape_rbsp(nalu.get(1..).ok_or(BitError::Eof)?);
        let mut r = BitReader::new(&rbsp);

        let profile_idc = r.read_bits(8)? as u8;
        r.skip_bits(8)?; // constraint flags + reserved
        let level_idc = r.read_bits(8)? as u8;
        let _sps_id = r.read_ue()?;

        let mut separate_colour_plane = false;
        let mut chroma_format_idc = 1;
        if HIGH_PROFILES.contains(&profile_idc) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                separate_colour_plane = r.read_bit()?;
            }
            let _bit_depth_luma = r.read_ue()?;
            let _bit_depth_chroma = r.read_ue()?;
            r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
            if r.read_bit()? {
                let lists = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..lists {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let log2_max_frame_num =
            at_most(r.read_ue()?, MAX_LOG2_MINUS4, "log2_max_frame_num_minus4")? + 4;
        let pic_order_cnt_type = r.read_ue()?;
        let mut log2_max_poc_lsb = 0;
        match pic_order_cnt_type {
            0 => {
                log2_max_poc_lsb =
                    at_most(r.read_ue()?, MAX_LOG2_MINUS4, "log2_max_pic_order_cnt_lsb_minus4")? + 4
            }
            1 => {
                r.skip_bits(1)?; // delta_pic_order_always_zero_flag
                let _offset_for_non_ref_pic = r.read_se()?;
                let _offset_for_top_to_bottom_field = r.read_se()?;
                let cycle = at_most(r.read_ue()?, MAX_POC_CYCLE, "num_ref_frames_in_pic_order_cnt_cycle")?;
                for _ in 0..cycle {
                    let _ = r.read_se()?;
                }
            }
            _ => {}
        }

        let _max_num_ref_frames = r.read_ue()?;
        r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
        let width_minus1 = r.read_ue()?;
        let height_minus1 = r.read_ue()?;
        let frame_mbs_only = r.read_bit()?;

        let field_factor = if frame_mbs_only { 1 } else { 2 };
        let width = width_minus1
            .checked_add(1)
            .and_then(|mbs| mbs.checked_mul(16))
            .ok_or(BitError::OutOfRange {
                field: "pic_width_in_mbs_minus1",
                value: width_minus1,
            })?;
        let height = height_minus1
            .checked_add(1)
            .and_then(|units| units.checked_mul(field_factor * 16))
            .ok_or(BitError::OutOfRange {
                field: "pic_height_in_map_units_minus1",
                value: height_minus1,
            })?;

        Ok(Self {
            profile_idc,
            level_idc,
            separate_colour_plane,
            log2_max_frame_num,
            pic_order_cnt_type,
            log2_max_poc_lsb,
            frame_mbs_only,
            width,
            height,
        })
    }
}

fn at_most(value: u32, max: u32, field: &'static str) -> Result<u32, BitError> {
    if value > max {
        return Err(BitError::OutOfRange { field, value });
    }
    Ok(value)
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), BitError> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// `pic_order_cnt_lsb` of a slice NAL unit (IDR or non-IDR).
///
/// Only meaningful for `pic_order_cnt_type == 0`.
pub fn slice_poc_lsb(nalu: &[u8], sps: &Sps) -> Result<u32, BitError> {
    if nalu.len() < 2 {
        return Err(BitError::Eof);
    }
    let idr = NaluType::of(nalu) == NaluType::Idr;
    // the header of a slice fits comfortably in the first 32 bytes
    let head = &nalu[1..nalu.len().min(32)];
    let rbsp = unescape_rbsp(head);
    let mut r = BitReader::new(&rbsp);

    let _first_mb_in_slice = r.read_ue()?;
    let _slice_type = r.read_ue()?;
    let _pps_id = r.read_ue()?;
    if sps.separate_colour_plane {
        r.skip_bits(2)?;
    }
    r.skip_bits(sps.log2_max_frame_num as usize)?;
    if !sps.frame_mbs_only && r.read_bit()? {
        r.skip_bits(1)?; // bottom_field_flag
    }
    if idr {
        let _idr_pic_id = r.read_ue()?;
    }
    r.read_bits(sps.log2_max_poc_lsb)
}
