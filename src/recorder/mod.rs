// src/recorder/mod.rs
//! RTSP ingest: session setup, the packet loop and everything it feeds.

use std::fs;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use crossbeam::channel::Sender;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::time::{Instant as TokioInstant, interval_at};

use crate::codec;
use crate::config::RecorderConfig;
use crate::core::{Component, ComponentLogger, LogContext, MuxError, RtspError, StopSignal};
use crate::events::SegmentRecord;
use crate::rtsp::{
    DepacketizeError, H264Depacketizer, RtpPacket, RtspClient, SessionDescription, StreamTarget,
    TimestampUnwrapper,
};

pub mod fanout;
#[cfg(feature = "rtsp-ffmpeg")]
pub mod ffmpeg;
pub mod muxer;

pub use fanout::{AnnexBDecoder, FrameDecoder, FrameFanout, FrameFormat, VideoFrame};
pub use muxer::{ActiveSegment, SEGMENT_BACKLOG, SegmentingMuxer};

/// What the coordinator needs from the ingest side beyond start/stop.
pub trait Recording: Component {
    /// Fires once the session loop has exited, for whatever reason.
    fn finished(&self) -> StopSignal;
    /// Record of the chunk that was open at stop time, available after `stop`.
    fn take_final_segment(&mut self) -> Option<SegmentRecord>;
}

/* =========================
   PACKET PIPELINE
   ========================= */

/// Per-packet processing: RTP → access unit → muxer, and → decoder → fanout.
pub struct Ingest {
    payload_type: u8,
    clock: TimestampUnwrapper,
    depacketizer: H264Depacketizer,
    muxer: SegmentingMuxer,
    decoder: Box<dyn FrameDecoder>,
    fanout: Arc<FrameFanout>,
    key_frame_seen: bool,
    access_units: u64,
    dropped_units: u64,
}

impl Ingest {
    pub fn new(
        payload_type: u8,
        muxer: SegmentingMuxer,
        decoder: Box<dyn FrameDecoder>,
        fanout: Arc<FrameFanout>,
    ) -> Self {
        Self {
            payload_type,
            clock: TimestampUnwrapper::new(),
            depacketizer: H264Depacketizer::new(),
            muxer,
            decoder,
            fanout,
            key_frame_seen: false,
            access_units: 0,
            dropped_units: 0,
        }
    }

    /// Only muxer failures are returned; everything else is logged and dropped.
    pub fn handle_rtp(&mut self, raw: Bytes) -> Result<(), MuxError> {
        let pkt = match RtpPacket::parse(raw) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::warn!("[recorder] {}", e);
                return Ok(());
            }
        };
        if pkt.payload_type != self.payload_type {
            log::debug!("[recorder] ignoring payload type {}", pkt.payload_type);
            return Ok(());
        }

        let pts = self.clock.unwrap(pkt.timestamp);
        let au = match self.depacketizer.push(&pkt) {
            Ok(au) => au,
            Err(e) if e.is_transient() => return Ok(()),
            Err(e @ DepacketizeError::FragmentGap { .. }) => {
                log::warn!("[recorder] {}, access unit dropped", e);
                return Ok(());
            }
            Err(e) => {
                log::warn!("[recorder] {}", e);
                return Ok(());
            }
        };

        self.access_units += 1;
        self.handle_access_unit(&au, pts)
    }

    /// A unit the muxer cannot timestamp is dropped; only file errors end the session.
    pub fn handle_access_unit(&mut self, au: &[Bytes], pts: Duration) -> Result<(), MuxError> {
        match self.muxer.encode(au, pts) {
            Ok(()) => {}
            Err(MuxError::Dts(e)) => {
                self.dropped_units += 1;
                log::warn!("[recorder] access unit at {:?} dropped: {}", pts, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if !self.key_frame_seen {
            if !codec::idr_present(au) {
                return Ok(());
            }
            self.key_frame_seen = true;
            log::info!("[recorder] first key frame at {:?}", pts);
        }

        match self.decoder.decode(au, pts) {
            Ok(Some(frame)) => self.fanout.send(frame),
            Ok(None) => {}
            Err(e) => log::warn!("[recorder] frame decode failed: {:#}", e),
        }
        Ok(())
    }

    #[cfg(test)]
    fn key_frame_seen(&self) -> bool {
        self.key_frame_seen
    }

    pub fn into_muxer(self) -> SegmentingMuxer {
        self.muxer
    }
}

/* =========================
   RECORDER COMPONENT
   ========================= */

struct SessionEnd {
    muxer: SegmentingMuxer,
    result: anyhow::Result<()>,
}

pub struct Recorder {
    cfg: RecorderConfig,
    segments: Sender<SegmentRecord>,
    fanout: Arc<FrameFanout>,
    active: ActiveSegment,
    stop: StopSignal,
    halt: watch::Sender<bool>,
    session: Option<String>,
    finished: StopSignal,
    thread_handle: Option<JoinHandle<SessionEnd>>,
    final_segment: Option<SegmentRecord>,
    stopped: bool,
}

impl Recorder {
    pub fn new(
        cfg: RecorderConfig,
        segments: Sender<SegmentRecord>,
        frames: Vec<Sender<VideoFrame>>,
        active: ActiveSegment,
    ) -> Self {
        let stop = StopSignal::new();
        Self {
            cfg,
            segments,
            fanout: Arc::new(FrameFanout::new(frames, stop.clone())),
            active,
            stop,
            halt: watch::channel(false).0,
            session: None,
            finished: StopSignal::new(),
            thread_handle: None,
            final_segment: None,
            stopped: false,
        }
    }

    fn open_session(&self, rt: &Runtime) -> anyhow::Result<(RtspClient, SessionDescription)> {
        let target = StreamTarget::parse(&self.cfg.url)?;
        let connect_timeout = self.cfg.connect_timeout();
        let session_timeout = self.cfg.session_timeout();

        let opened = rt.block_on(async move {
            let mut client = RtspClient::connect(target, connect_timeout, session_timeout).await?;
            let sdp = client.start_session().await?;
            Ok::<_, RtspError>((client, sdp))
        })?;
        Ok(opened)
    }
}

impl ComponentLogger for Recorder {
    fn log_context(&self) -> LogContext {
        let ctx = LogContext::new("Recorder", &self.cfg.recordings_dir.display().to_string());
        match &self.session {
            Some(session) => ctx.with_session(session),
            None => ctx,
        }
    }
}

impl Component for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }
        if self.stopped {
            bail!("recorder cannot be restarted after stop");
        }

        fs::create_dir_all(&self.cfg.recordings_dir).with_context(|| {
            format!(
                "create recordings dir {}",
                self.cfg.recordings_dir.display()
            )
        })?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build recorder runtime")?;
        let (client, sdp) = self
            .open_session(&rt)
            .with_context(|| format!("open rtsp session {}", redact(&self.cfg.url)))?;
        self.session = client.session_id().map(str::to_string);

        let mut muxer = SegmentingMuxer::new(
            self.cfg.recordings_dir.clone(),
            self.cfg.chunk_duration(),
            self.segments.clone(),
            self.active.clone(),
        );
        muxer.seed_parameter_sets(sdp.video.sps.clone(), sdp.video.pps.clone());

        let decoder = default_decoder(sdp.video.sps.clone(), sdp.video.pps.clone());
        let ingest = Ingest::new(sdp.video.payload_type, muxer, decoder, self.fanout.clone());

        let halted = self.halt.subscribe();
        let finished = self.finished.clone();
        let handle = std::thread::Builder::new()
            .name("recorder".into())
            .spawn(move || {
                let end = rt.block_on(run_session(client, ingest, halted));
                finished.trigger();
                end
            })
            .context("spawn recorder thread")?;

        self.thread_handle = Some(handle);
        self.info("session running");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.stop.trigger();
        self.halt.send_replace(true);
        self.stopped = true;

        let Some(handle) = self.thread_handle.take() else {
            return Ok(());
        };
        let end = handle
            .join()
            .map_err(|_| anyhow!("recorder thread panicked"))?;

        let closed = end.muxer.close().context("close muxer");
        match closed {
            Ok(record) => self.final_segment = record,
            Err(e) if end.result.is_ok() => return Err(e),
            Err(e) => self.error(&format!("{:#}", e)),
        }

        self.info("stopped");
        end.result
    }
}

impl Recording for Recorder {
    fn finished(&self) -> StopSignal {
        self.finished.clone()
    }

    fn take_final_segment(&mut self) -> Option<SegmentRecord> {
        self.final_segment.take()
    }
}

async fn run_session(
    mut client: RtspClient,
    mut ingest: Ingest,
    mut halted: watch::Receiver<bool>,
) -> SessionEnd {
    let result = pump(&mut client, &mut ingest, &mut halted).await;
    match &result {
        Ok(()) => log::info!(
            "[recorder] session closed after {} access units ({} dropped)",
            ingest.access_units, ingest.dropped_units
        ),
        Err(e) => log::error!("[recorder] session ended: {:#}", e),
    }
    client.teardown().await;
    SessionEnd {
        muxer: ingest.into_muxer(),
        result,
    }
}

async fn pump(
    client: &mut RtspClient,
    ingest: &mut Ingest,
    halted: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let rtp_channel = client.rtp_channel();
    let period = client.keepalive_interval().max(Duration::from_secs(1));
    let mut keepalive = interval_at(TokioInstant::now() + period, period);

    loop {
        tokio::select! {
            biased;
            _ = halt_requested(halted) => return Ok(()),
            frame = client.next_interleaved() => {
                let (channel, payload) = frame.context("rtsp session")?;
                // RTCP and anything else on other channels is ignored
                if channel == rtp_channel {
                    ingest.handle_rtp(payload).context("mux access unit")?;
                }
            }
            _ = keepalive.tick() => {
                client.send_keepalive().await.context("send keep-alive")?;
            }
        }
    }
}

/// Resolves once `stop` has been requested, or the recorder is gone.
async fn halt_requested(halted: &mut watch::Receiver<bool>) {
    let _ = halted.wait_for(|halt| *halt).await;
}

#[cfg(feature = "rtsp-ffmpeg")]
fn default_decoder(sps: Option<Bytes>, pps: Option<Bytes>) -> Box<dyn FrameDecoder> {
    match ffmpeg::FfmpegDecoder::new(sps.clone(), pps.clone()) {
        Ok(decoder) => Box::new(decoder),
        Err(e) => {
            log::warn!("[recorder] ffmpeg decoder unavailable, passing access units through: {:#}", e);
            Box::new(AnnexBDecoder::with_parameter_sets(sps, pps))
        }
    }
}

#[cfg(not(feature = "rtsp-ffmpeg"))]
fn default_decoder(sps: Option<Bytes>, pps: Option<Bytes>) -> Box<dyn FrameDecoder> {
    Box::new(AnnexBDecoder::with_parameter_sets(sps, pps))
}

/// Hides the password in log output.
fn redact(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}
