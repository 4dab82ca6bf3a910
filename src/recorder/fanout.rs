// src/recorder/fanout.rs
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{Sender, TrySendError};

use crate::codec::{self, NaluType};
use crate::core::StopSignal;
use crate::core::lock::lock_mutex;

/// Layout of [`VideoFrame::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Annex-B access unit; key frames carry their parameter sets.
    AnnexB,
    /// Packed RGB24 rows without padding.
    #[cfg(feature = "rtsp-ffmpeg")]
    Rgb24 { width: u32, height: u32 },
}

/// A picture handed to frame consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub pts: Duration,
    pub keyframe: bool,
    pub format: FrameFormat,
    pub data: Bytes,
}

/// Turns access units into frames. Implementations may hold decoder state.
pub trait FrameDecoder: Send {
    fn decode(&mut self, au: &[Bytes], pts: Duration) -> anyhow::Result<Option<VideoFrame>>;
}

/// Passes access units through as Annex-B, making key frames self-contained.
/// The default when the `rtsp-ffmpeg` feature is off.
#[derive(Debug, Default)]
pub struct AnnexBDecoder {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl AnnexBDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter_sets(sps: Option<Bytes>, pps: Option<Bytes>) -> Self {
        Self { sps, pps }
    }
}

impl FrameDecoder for AnnexBDecoder {
    fn decode(&mut self, au: &[Bytes], pts: Duration) -> anyhow::Result<Option<VideoFrame>> {
        let mut has_sps = false;
        let mut has_pps = false;
        let mut has_picture = false;
        for nalu in au {
            match NaluType::of(nalu) {
                NaluType::Sps => {
                    self.sps = Some(nalu.clone());
                    has_sps = true;
                }
                NaluType::Pps => {
                    self.pps = Some(nalu.clone());
                    has_pps = true;
                }
                NaluType::Idr | NaluType::NonIdr => has_picture = true,
                _ => {}
            }
        }
        if !has_picture {
            return Ok(None);
        }

        let keyframe = codec::idr_present(au);
        if !keyframe || (has_sps && has_pps) {
            return Ok(Some(VideoFrame {
                pts,
                keyframe,
                format: FrameFormat::AnnexB,
                data: codec::to_annex_b(au),
            }));
        }

        let mut data = BytesMut::new();
        if !has_sps {
            if let Some(sps) = &self.sps {
                data.extend_from_slice(&codec::START_CODE);
                data.extend_from_slice(sps);
            }
        }
        if !has_pps {
            if let Some(pps) = &self.pps {
                data.extend_from_slice(&codec::START_CODE);
                data.extend_from_slice(pps);
            }
        }
        data.extend_from_slice(&codec::to_annex_b(au));
        Ok(Some(VideoFrame {
            pts,
            keyframe,
            format: FrameFormat::AnnexB,
            data: data.freeze(),
        }))
    }
}

/// Non-blocking distribution of frames to any number of bounded mailboxes.
///
/// A full mailbox loses the frame, a disconnected one is dropped from the
/// subscriber list. Nothing is sent once the stop signal has fired.
pub struct FrameFanout {
    subscribers: Mutex<Vec<Sender<VideoFrame>>>,
    stop: StopSignal,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl FrameFanout {
    pub fn new(subscribers: Vec<Sender<VideoFrame>>, stop: StopSignal) -> Self {
        Self {
            subscribers: Mutex::new(subscribers),
            stop,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, tx: Sender<VideoFrame>) {
        lock_mutex(&self.subscribers, "FrameFanout::subscribe").push(tx);
    }

    pub fn send(&self, frame: VideoFrame) {
        if self.stop.is_triggered() {
            return;
        }

        let mut subscribers = lock_mutex(&self.subscribers, "FrameFanout::send");
        subscribers.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("[fanout] subscriber full, frame dropped ({} total)", dropped);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("[fanout] subscriber gone");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock_mutex(&self.subscribers, "FrameFanout::subscriber_count").len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn frame(ms: u64) -> VideoFrame {
        VideoFrame {
            pts: Duration::from_millis(ms),
            keyframe: false,
            format: FrameFormat::AnnexB,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x41]),
        }
    }

    #[test]
    fn test_disconnected_subscriber_is_removed() {
        let (tx1, rx1) = channel::bounded(4);
        let (tx2, rx2) = channel::bounded(4);
        let fanout = FrameFanout::new(vec![tx1, tx2], StopSignal::new());
        drop(rx2);

        fanout.send(frame(0));
        assert_eq!(fanout.subscriber_count(), 1);
        assert_eq!(rx1.try_recv().unwrap().pts, Duration::ZERO);
        assert_eq!(fanout.delivered(), 1);
    }

    #[test]
    fn test_nothing_sent_after_stop() {
        let (tx, rx) = channel::bounded(4);
        let stop = StopSignal::new();
        let fanout = FrameFanout::new(vec![tx], stop.clone());
        stop.trigger();
        fanout.send(frame(0));
        assert!(rx.try_recv().is_err());
        assert_eq!(fanout.delivered(), 0);
    }

    #[test]
    fn test_annexb_decoder_prepends_cached_parameter_sets() {
        let mut dec = AnnexBDecoder::with_parameter_sets(
            Some(Bytes::from_static(&[0x67, 0x42])),
            Some(Bytes::from_static(&[0x68, 0xCE])),
        );
        let au = vec![Bytes::from_static(&[0x65, 0x88])];
        let f = dec.decode(&au, Duration::from_millis(40)).unwrap().unwrap();
        assert!(f.keyframe);
        assert_eq!(
            &f.data[..],
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65, 0x88]
        );

        let delta = vec![Bytes::from_static(&[0x41, 0x9A])];
        let f = dec.decode(&delta, Duration::from_millis(80)).unwrap().unwrap();
        assert!(!f.keyframe);
        assert_eq!(&f.data[..], &[0, 0, 0, 1, 0x41, 0x9A]);
    }

    #[test]
    fn test_annexb_decoder_skips_units_without_picture() {
        let mut dec = AnnexBDecoder::new();
        let au = vec![Bytes::from_static(&[0x06, 0x05])];
        assert!(dec.decode(&au, Duration::ZERO).unwrap().is_none());
    }
}
