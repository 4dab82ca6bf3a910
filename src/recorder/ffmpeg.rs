// src/recorder/ffmpeg.rs
//! H.264 to RGB24 decoding through FFmpeg (feature `rtsp-ffmpeg`).

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use ffmpeg_next as ffmpeg;

use super::fanout::{AnnexBDecoder, FrameDecoder, FrameFormat, VideoFrame};
use crate::core::{duration_to_ticks, ticks_to_duration};

/// Decodes access units into packed RGB frames.
///
/// Input goes through [`AnnexBDecoder`] first so every key frame reaches
/// FFmpeg with its parameter sets in band.
pub struct FfmpegDecoder {
    annexb: AnnexBDecoder,
    decoder: ffmpeg::codec::decoder::Video,
}

impl FfmpegDecoder {
    pub fn new(sps: Option<Bytes>, pps: Option<Bytes>) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let codec = ffmpeg::codec::decoder::find(ffmpeg::codec::Id::H264)
            .ok_or_else(|| anyhow!("ffmpeg was built without an H264 decoder"))?;
        let decoder = ffmpeg::codec::context::Context::new()
            .decoder()
            .open_as(codec)
            .context("open ffmpeg H264 decoder")?
            .video()
            .context("open ffmpeg video decoder")?;

        Ok(Self {
            annexb: AnnexBDecoder::with_parameter_sets(sps, pps),
            decoder,
        })
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn decode(&mut self, au: &[Bytes], pts: Duration) -> Result<Option<VideoFrame>> {
        let Some(unit) = self.annexb.decode(au, pts)? else {
            return Ok(None);
        };

        let mut packet = ffmpeg::Packet::copy(&unit.data);
        packet.set_pts(Some(duration_to_ticks(pts)));
        self.decoder
            .send_packet(&packet)
            .context("send packet to ffmpeg decoder")?;

        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            // still filling the reorder buffer
            return Ok(None);
        }

        let mut rgb = ffmpeg::frame::Video::empty();
        let mut scaler = ffmpeg::software::scaling::context::Context::get(
            decoded.format(),
            decoded.width(),
            decoded.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoded.width(),
            decoded.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;
        scaler
            .run(&decoded, &mut rgb)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb)?;

        let frame_pts = decoded
            .pts()
            .filter(|t| *t >= 0)
            .map(|t| ticks_to_duration(t as u64))
            .unwrap_or(pts);
        Ok(Some(VideoFrame {
            pts: frame_pts,
            keyframe: decoded.is_key(),
            format: FrameFormat::Rgb24 { width, height },
            data: Bytes::from(pixels),
        }))
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_without_picture_are_skipped() {
        let mut dec = FfmpegDecoder::new(None, None).unwrap();
        let sei = vec![Bytes::from_static(&[0x06, 0x05, 0x00])];
        assert!(dec.decode(&sei, Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_garbage_slice_is_an_error_or_nothing() {
        let mut dec = FfmpegDecoder::new(None, None).unwrap();
        let junk = vec![Bytes::from_static(&[0x65, 0xFF, 0xFF, 0xFF])];
        // never a frame out of a slice without parameter sets
        if let Ok(frame) = dec.decode(&junk, Duration::ZERO) {
            assert!(frame.is_none());
        }
    }
}
