use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::core::RtspError;

/// The H.264 media section picked out of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMedia {
    pub payload_type: u8,
    pub control: Option<String>,
    pub packetization_mode: u8,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub control: Option<String>,
    pub video: VideoMedia,
}

#[derive(Default)]
struct MediaBlock {
    kind: String,
    formats: Vec<u8>,
    h264_pt: Option<u8>,
    control: Option<String>,
    fmtp: Vec<(u8, String)>,
}

/// Parses an SDP body and selects the first `m=video` section carrying `H264/90000`.
pub fn parse(text: &str) -> Result<SessionDescription, RtspError> {
    let mut session_control = None;
    let mut blocks: Vec<MediaBlock> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if let Some(media) = line.strip_prefix("m=") {
            let mut fields = media.split_whitespace();
            let kind = fields.next().unwrap_or_default().to_string();
            // port and protocol
            let formats = fields.skip(2).filter_map(|f| f.parse().ok()).collect();
            blocks.push(MediaBlock {
                kind,
                formats,
                ..Default::default()
            });
            continue;
        }

        let Some(attr) = line.strip_prefix("a=") else {
            continue;
        };

        match blocks.last_mut() {
            None => {
                if let Some(control) = attr.strip_prefix("control:") {
                    session_control = Some(control.trim().to_string());
                }
            }
            Some(block) => {
                if let Some(control) = attr.strip_prefix("control:") {
                    block.control = Some(control.trim().to_string());
                } else if let Some(map) = attr.strip_prefix("rtpmap:") {
                    let (pt, encoding) = map.split_once(' ').unwrap_or((map, ""));
                    if encoding.trim().to_ascii_uppercase().starts_with("H264/90000") {
                        block.h264_pt = pt.trim().parse().ok();
                    }
                } else if let Some(fmtp) = attr.strip_prefix("fmtp:") {
                    let (pt, params) = fmtp.split_once(' ').unwrap_or((fmtp, ""));
                    if let Ok(pt) = pt.trim().parse() {
                        block.fmtp.push((pt, params.trim().to_string()));
                    }
                }
            }
        }
    }

    let block = blocks
        .into_iter()
        .find(|b| {
            b.kind == "video" && b.h264_pt.map(|pt| b.formats.contains(&pt)).unwrap_or(false)
        })
        .ok_or(RtspError::NoVideoMedia)?;

    let payload_type = block.h264_pt.ok_or(RtspError::NoVideoMedia)?;
    let mut video = VideoMedia {
        payload_type,
        control: block.control,
        packetization_mode: 0,
        sps: None,
        pps: None,
    };

    if let Some((_, params)) = block.fmtp.iter().find(|(pt, _)| *pt == payload_type) {
        for param in params.split(';') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "packetization-mode" => {
                    video.packetization_mode = value.trim().parse().map_err(|_| {
                        RtspError::MalformedSdp(format!("bad packetization-mode '{}'", value))
                    })?;
                }
                "sprop-parameter-sets" => {
                    let (sps, pps) = parse_sprop(value.trim())?;
                    video.sps = sps;
                    video.pps = pps;
                }
                _ => {}
            }
        }
    }

    Ok(SessionDescription {
        control: session_control,
        video,
    })
}

fn parse_sprop(value: &str) -> Result<(Option<Bytes>, Option<Bytes>), RtspError> {
    let mut sps = None;
    let mut pps = None;
    for part in value.split(',').filter(|p| !p.is_empty()) {
        let nalu = STANDARD
            .decode(part)
            .map_err(|e| RtspError::MalformedSdp(format!("sprop-parameter-sets: {}", e)))?;
        match nalu.first().map(|b| b & 0x1F) {
            Some(7) => sps = Some(Bytes::from(nalu)),
            Some(8) => pps = Some(Bytes::from(nalu)),
            _ => {}
        }
    }
    Ok((sps, pps))
}

/// Resolves a media `a=control` attribute against the presentation base URL.
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("") | Some("*") => base.to_string(),
        Some(c) if c.starts_with("rtsp://") || c.starts_with("rtsps://") => c.to_string(),
        Some(c) => {
            let base = base.trim_end_matches('/');
            let c = c.trim_start_matches('/');
            format!("{}/{}", base, c)
        }
    }
}
