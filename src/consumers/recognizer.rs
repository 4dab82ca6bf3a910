// src/consumers/recognizer.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context, anyhow};
use chrono::Utc;
use crossbeam::channel::{Receiver, Sender};
use crossbeam::select;

use crate::config::RecognizerConfig;
use crate::core::{Component, ComponentLogger, LogContext, StopSignal, file_stamp};
use crate::events::{Delivery, RecognizedRecord, offer};
use crate::recorder::{FrameFormat, VideoFrame};

/// Keeps every n-th key frame as a still and reports it.
///
/// Pass-through frames become self-contained `.h264` files; with the
/// `rtsp-ffmpeg` feature decoded frames are written as JPEG.
///
/// Stands in for a real detector: the interesting part is the mailbox
/// discipline, not the recognition.
pub struct KeyframeRecognizer {
    thumbs_dir: PathBuf,
    context_label: String,
    every_nth: u64,
    frames: Receiver<VideoFrame>,
    recognitions: Sender<RecognizedRecord>,
    keyframes: Arc<AtomicU64>,
    stills: Arc<AtomicU64>,
    stop: StopSignal,
    thread_handle: Option<JoinHandle<()>>,
}

impl KeyframeRecognizer {
    pub fn new(
        cfg: &RecognizerConfig,
        frames: Receiver<VideoFrame>,
        recognitions: Sender<RecognizedRecord>,
    ) -> Self {
        Self {
            thumbs_dir: cfg.thumbs_dir.clone(),
            context_label: cfg.context_label.clone(),
            every_nth: u64::from(cfg.every_nth.max(1)),
            frames,
            recognitions,
            keyframes: Arc::new(AtomicU64::new(0)),
            stills: Arc::new(AtomicU64::new(0)),
            stop: StopSignal::new(),
            thread_handle: None,
        }
    }

    pub fn keyframes_seen(&self) -> u64 {
        self.keyframes.load(Ordering::Relaxed)
    }

    pub fn stills_written(&self) -> u64 {
        self.stills.load(Ordering::Relaxed)
    }
}

impl ComponentLogger for KeyframeRecognizer {
    fn log_context(&self) -> LogContext {
        LogContext::new("Recognizer", &self.context_label)
    }
}

impl Component for KeyframeRecognizer {
    fn name(&self) -> &str {
        "recognizer"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.thumbs_dir)
            .with_context(|| format!("create thumbs dir {}", self.thumbs_dir.display()))?;

        self.stop = StopSignal::new();
        let worker = Worker {
            thumbs_dir: self.thumbs_dir.clone(),
            context_label: self.context_label.clone(),
            every_nth: self.every_nth,
            recognitions: self.recognitions.clone(),
            keyframes: self.keyframes.clone(),
            stills: self.stills.clone(),
            stop: self.stop.clone(),
        };
        let frames = self.frames.clone();

        let handle = std::thread::Builder::new()
            .name("recognizer".into())
            .spawn(move || worker.run(frames))
            .context("spawn recognizer thread")?;

        self.thread_handle = Some(handle);
        self.info(&format!("keeping every {} key frame(s)", self.every_nth));
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.stop.trigger();
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("recognizer thread panicked"))?;
            self.info(&format!(
                "stopped, {} still(s) from {} key frame(s)",
                self.stills_written(),
                self.keyframes_seen()
            ));
        }
        Ok(())
    }
}

struct Worker {
    thumbs_dir: PathBuf,
    context_label: String,
    every_nth: u64,
    recognitions: Sender<RecognizedRecord>,
    keyframes: Arc<AtomicU64>,
    stills: Arc<AtomicU64>,
    stop: StopSignal,
}

impl Worker {
    fn run(self, frames: Receiver<VideoFrame>) {
        loop {
            select! {
                recv(frames) -> msg => match msg {
                    Ok(frame) => self.handle(frame),
                    Err(_) => {
                        log::debug!("[recognizer] frame source gone");
                        self.stop.wait();
                        break;
                    }
                },
                recv(self.stop.receiver()) -> _ => break,
            }
        }
    }

    fn handle(&self, frame: VideoFrame) {
        if !frame.keyframe {
            return;
        }
        let index = self.keyframes.fetch_add(1, Ordering::Relaxed);
        if index % self.every_nth != 0 {
            return;
        }

        let created_at = Utc::now();
        let path = self.thumbs_dir.join(format!(
            "thumb_{}_{}.{}",
            file_stamp(created_at),
            index,
            still_extension(frame.format)
        ));
        if let Err(e) = write_still(&path, &frame) {
            log::warn!("[recognizer] {:#}", e);
            return;
        }
        self.stills.fetch_add(1, Ordering::Relaxed);

        if self.stop.is_triggered() {
            return;
        }
        let record = RecognizedRecord {
            path,
            context: self.context_label.clone(),
            created_at,
        };
        match offer(&self.recognitions, record) {
            Delivery::Sent => {}
            Delivery::Full => log::debug!("[recognizer] recognition mailbox full, dropped"),
            Delivery::Closed => log::debug!("[recognizer] recognition mailbox closed"),
        }
    }
}

fn still_extension(format: FrameFormat) -> &'static str {
    match format {
        FrameFormat::AnnexB => "h264",
        #[cfg(feature = "rtsp-ffmpeg")]
        FrameFormat::Rgb24 { .. } => "jpg",
    }
}

fn write_still(path: &Path, frame: &VideoFrame) -> anyhow::Result<()> {
    match frame.format {
        FrameFormat::AnnexB => {
            fs::write(path, &frame.data).with_context(|| format!("write still {}", path.display()))
        }
        #[cfg(feature = "rtsp-ffmpeg")]
        FrameFormat::Rgb24 { width, height } => {
            let img = image::RgbImage::from_raw(width, height, frame.data.to_vec())
                .ok_or_else(|| anyhow!("{}x{} frame has {} bytes", width, height, frame.data.len()))?;
            img.save_with_format(path, image::ImageFormat::Jpeg)
                .with_context(|| format!("write still {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crossbeam::channel;
    use std::time::Duration;

    fn frame(keyframe: bool) -> VideoFrame {
        VideoFrame {
            pts: Duration::ZERO,
            keyframe,
            format: FrameFormat::AnnexB,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]),
        }
    }

    #[test]
    fn test_keeps_every_nth_key_frame() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecognizerConfig {
            thumbs_dir: dir.path().join("thumbs"),
            every_nth: 2,
            ..Default::default()
        };
        let (frame_tx, frame_rx) = channel::bounded(16);
        let (rec_tx, rec_rx) = channel::bounded(16);
        let mut recognizer = KeyframeRecognizer::new(&cfg, frame_rx, rec_tx);
        recognizer.start().unwrap();

        for keyframe in [true, false, true, false, true] {
            frame_tx.send(frame(keyframe)).unwrap();
        }
        let first = rec_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rec_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        recognizer.stop().unwrap();

        assert_eq!(recognizer.keyframes_seen(), 3);
        assert_eq!(recognizer.stills_written(), 2);
        assert_eq!(first.context, "keyframe");
        assert!(first.path.starts_with(&cfg.thumbs_dir));
        assert_eq!(fs::read(&second.path).unwrap(), [0, 0, 0, 1, 0x65, 0x88]);
        assert!(rec_rx.try_recv().is_err());
    }

    #[cfg(feature = "rtsp-ffmpeg")]
    #[test]
    fn test_decoded_frames_are_written_as_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecognizerConfig {
            thumbs_dir: dir.path().to_path_buf(),
            every_nth: 1,
            ..Default::default()
        };
        let (frame_tx, frame_rx) = channel::bounded(4);
        let (rec_tx, rec_rx) = channel::bounded(4);
        let mut recognizer = KeyframeRecognizer::new(&cfg, frame_rx, rec_tx);
        recognizer.start().unwrap();

        frame_tx
            .send(VideoFrame {
                pts: Duration::ZERO,
                keyframe: true,
                format: FrameFormat::Rgb24 { width: 4, height: 2 },
                data: Bytes::from(vec![128u8; 4 * 2 * 3]),
            })
            .unwrap();
        let record = rec_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        recognizer.stop().unwrap();

        assert_eq!(record.path.extension().unwrap(), "jpg");
        let img = image::open(&record.path).unwrap();
        assert_eq!((img.width(), img.height()), (4, 2));
    }

    #[test]
    fn test_stop_with_disconnected_source() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecognizerConfig {
            thumbs_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (frame_tx, frame_rx) = channel::bounded::<VideoFrame>(1);
        let (rec_tx, _rec_rx) = channel::bounded(1);
        let mut recognizer = KeyframeRecognizer::new(&cfg, frame_rx, rec_tx);
        recognizer.start().unwrap();
        drop(frame_tx);
        std::thread::sleep(Duration::from_millis(20));
        recognizer.stop().unwrap();
        assert_eq!(recognizer.stills_written(), 0);
    }
}
