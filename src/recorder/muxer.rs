// src/recorder/muxer.rs
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam::channel::{Sender, TrySendError};

use crate::codec::dts::DtsExtractor;
use crate::codec::{self, AUD_NALU, AccessUnit, NaluType};
use crate::container::TsWriter;
use crate::core::lock::lock_mutex;
use crate::core::{MuxError, duration_to_ticks, file_stamp};
use crate::events::SegmentRecord;

/// Segment records kept while the segment mailbox is full.
pub const SEGMENT_BACKLOG: usize = 16;
const MAX_NAME_COLLISIONS: u32 = 1000;

/// Path of the chunk file the muxer is currently writing, shared with retention.
#[derive(Debug, Clone, Default)]
pub struct ActiveSegment(Arc<Mutex<Option<PathBuf>>>);

impl ActiveSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: Option<PathBuf>) {
        *lock_mutex(&self.0, "ActiveSegment::set") = path;
    }

    pub fn current(&self) -> Option<PathBuf> {
        lock_mutex(&self.0, "ActiveSegment::current").clone()
    }

    pub fn is_active(&self, path: &Path) -> bool {
        lock_mutex(&self.0, "ActiveSegment::is_active").as_deref() == Some(path)
    }
}

struct Chunk {
    path: PathBuf,
    writer: TsWriter<BufWriter<File>>,
    started: Instant,
    start_time: DateTime<Utc>,
    units: u64,
}

/// Writes access units into keyframe-aligned MPEG-TS chunk files.
///
/// A chunk is opened on the first unit that is actually written, and closed on
/// the first IDR after the chunk duration has elapsed. Every chunk therefore
/// starts with PAT, PMT, SPS, PPS and an IDR picture.
pub struct SegmentingMuxer {
    dir: PathBuf,
    chunk_duration: Duration,
    segments: Sender<SegmentRecord>,
    active: ActiveSegment,
    pending: VecDeque<SegmentRecord>,
    chunk: Option<Chunk>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    dts: Option<DtsExtractor>,
    units_written: u64,
}

impl SegmentingMuxer {
    pub fn new(
        dir: impl Into<PathBuf>,
        chunk_duration: Duration,
        segments: Sender<SegmentRecord>,
        active: ActiveSegment,
    ) -> Self {
        Self {
            dir: dir.into(),
            chunk_duration,
            segments,
            active,
            pending: VecDeque::new(),
            chunk: None,
            sps: None,
            pps: None,
            dts: None,
            units_written: 0,
        }
    }

    /// Parameter sets announced out of band (SDP `sprop-parameter-sets`).
    pub fn seed_parameter_sets(&mut self, sps: Option<Bytes>, pps: Option<Bytes>) {
        if sps.is_some() {
            self.sps = sps;
        }
        if pps.is_some() {
            self.pps = pps;
        }
    }

    #[cfg(test)]
    pub(crate) fn units_written(&self) -> u64 {
        self.units_written
    }

    #[cfg(test)]
    fn pending_records(&self) -> usize {
        self.pending.len()
    }

    pub fn encode(&mut self, au: &[Bytes], pts: Duration) -> Result<(), MuxError> {
        self.flush_pending();

        let idr = codec::idr_present(au);
        if idr {
            let due = self
                .chunk
                .as_ref()
                .map(|c| c.started.elapsed() > self.chunk_duration)
                .unwrap_or(false);
            if due {
                self.rollover()?;
            }
        }

        let mut body: AccessUnit = Vec::with_capacity(au.len());
        let mut picture = false;
        for nalu in au {
            match NaluType::of(nalu) {
                NaluType::Sps => self.sps = Some(nalu.clone()),
                NaluType::Pps => self.pps = Some(nalu.clone()),
                NaluType::AccessUnitDelimiter => {}
                kind => {
                    picture |= matches!(kind, NaluType::Idr | NaluType::NonIdr);
                    body.push(nalu.clone());
                }
            }
        }
        if !picture {
            return Ok(());
        }

        let mut filtered: AccessUnit = Vec::with_capacity(body.len() + 3);
        filtered.push(Bytes::from_static(&AUD_NALU));
        if idr {
            filtered.extend(self.sps.iter().cloned());
            filtered.extend(self.pps.iter().cloned());
        }
        filtered.extend(body);

        let dts = match self.dts.as_mut() {
            Some(extractor) => extractor.extract(&filtered, pts)?,
            None if idr => {
                let mut extractor = DtsExtractor::new();
                let dts = extractor.extract(&filtered, pts)?;
                self.dts = Some(extractor);
                dts
            }
            // nothing is written before the first key frame
            None => return Ok(()),
        };

        if self.chunk.is_none() {
            let chunk = open_chunk(&self.dir)?;
            log::info!("[muxer] new chunk {}", chunk.path.display());
            self.active.set(Some(chunk.path.clone()));
            self.chunk = Some(chunk);
        }
        let Some(chunk) = self.chunk.as_mut() else {
            return Ok(());
        };

        chunk.writer.write_access_unit(
            duration_to_ticks(pts).max(0) as u64,
            duration_to_ticks(dts).max(0) as u64,
            idr,
            &codec::to_annex_b(&filtered),
        )?;
        chunk.units += 1;
        self.units_written += 1;
        Ok(())
    }

    /// Closes the current chunk and returns its record instead of publishing it.
    pub fn close(mut self) -> Result<Option<SegmentRecord>, MuxError> {
        self.flush_pending();
        if !self.pending.is_empty() {
            log::warn!(
                "[muxer] {} segment record(s) never delivered",
                self.pending.len()
            );
        }

        match self.chunk.take() {
            Some(chunk) => {
                let record = self.finish_chunk(chunk)?;
                log::info!(
                    "[muxer] closed final chunk {} ({} units this session)",
                    record.path.display(),
                    self.units_written
                );
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn rollover(&mut self) -> Result<(), MuxError> {
        if let Some(chunk) = self.chunk.take() {
            let record = self.finish_chunk(chunk)?;
            log::info!(
                "[muxer] chunk complete {} ({} s)",
                record.path.display(),
                (record.end_time - record.start_time).num_milliseconds() as f64 / 1000.0
            );
            self.publish(record);
        }
        Ok(())
    }

    fn finish_chunk(&mut self, chunk: Chunk) -> Result<SegmentRecord, MuxError> {
        let end_time = Utc::now();
        let mut buffered = chunk.writer.into_inner();
        buffered.flush()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        drop(file);
        self.active.set(None);

        log::debug!("[muxer] {} units in {}", chunk.units, chunk.path.display());
        Ok(SegmentRecord {
            path: chunk.path,
            start_time: chunk.start_time,
            end_time,
        })
    }

    fn publish(&mut self, record: SegmentRecord) {
        self.pending.push_back(record);
        if self.pending.len() > SEGMENT_BACKLOG {
            if let Some(lost) = self.pending.pop_front() {
                log::error!(
                    "[muxer] segment backlog full, dropping record for {}",
                    lost.path.display()
                );
            }
        }
        self.flush_pending();
    }

    fn flush_pending(&mut self) {
        while let Some(record) = self.pending.pop_front() {
            match self.segments.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(record)) => {
                    self.pending.push_front(record);
                    break;
                }
                Err(TrySendError::Disconnected(record)) => {
                    log::warn!(
                        "[muxer] segment mailbox closed, dropping {} record(s) starting with {}",
                        self.pending.len() + 1,
                        record.path.display()
                    );
                    self.pending.clear();
                    break;
                }
            }
        }
    }
}

/// `feed_<stamp>.ts`, or `feed_<stamp>-<n>.ts` when that name is taken.
fn open_chunk(dir: &Path) -> Result<Chunk, MuxError> {
    let start_time = Utc::now();
    let stem = format!("feed_{}", file_stamp(start_time));

    let mut n = 0u32;
    loop {
        let name = if n == 0 {
            format!("{}.ts", stem)
        } else {
            format!("{}-{}.ts", stem, n)
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                return Ok(Chunk {
                    path,
                    writer: TsWriter::new(BufWriter::new(file)),
                    started: Instant::now(),
                    start_time,
                    units: 0,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && n < MAX_NAME_COLLISIONS => {
                n += 1;
            }
            Err(source) => return Err(MuxError::CreateFile { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sps::testutil::{build_pps, build_slice, build_sps};
    use crossbeam::channel;

    fn record(name: &str) -> SegmentRecord {
        SegmentRecord {
            path: PathBuf::from(name),
            start_time: Utc::now(),
            end_time: Utc::now(),
        }
    }

    fn key_au() -> Vec<Bytes> {
        vec![
            Bytes::from(build_sps(2)),
            Bytes::from(build_pps()),
            Bytes::from(build_slice(true, 0)),
        ]
    }

    #[test]
    fn test_backlog_retries_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel::bounded(1);
        let mut muxer =
            SegmentingMuxer::new(dir.path(), Duration::from_secs(8), tx, ActiveSegment::new());

        for i in 0..(SEGMENT_BACKLOG + 3) {
            muxer.publish(record(&format!("r{}", i)));
        }
        // one in the mailbox, the backlog holds the newest SEGMENT_BACKLOG
        assert_eq!(rx.len(), 1);
        assert_eq!(muxer.pending_records(), SEGMENT_BACKLOG);

        assert_eq!(rx.recv().unwrap().path, PathBuf::from("r0"));
        muxer.flush_pending();
        assert_eq!(rx.recv().unwrap().path, PathBuf::from("r3"));
    }

    #[test]
    fn test_disconnected_mailbox_drops_records() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel::bounded(1);
        drop(rx);
        let mut muxer =
            SegmentingMuxer::new(dir.path(), Duration::from_secs(8), tx, ActiveSegment::new());
        muxer.publish(record("a"));
        assert_eq!(muxer.pending_records(), 0);
    }

    #[test]
    fn test_active_segment_tracks_open_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel::bounded(4);
        let active = ActiveSegment::new();
        let mut muxer = SegmentingMuxer::new(dir.path(), Duration::from_secs(8), tx, active.clone());

        assert!(active.current().is_none());
        muxer.encode(&key_au(), Duration::ZERO).unwrap();
        let open = active.current().unwrap();
        assert!(active.is_active(&open));

        let record = muxer.close().unwrap().unwrap();
        assert_eq!(record.path, open);
        assert!(active.current().is_none());
    }

    #[test]
    fn test_name_collision_gets_counter_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let first = open_chunk(dir.path()).unwrap();
        let second = open_chunk(dir.path()).unwrap();
        let third = open_chunk(dir.path()).unwrap();
        let names: Vec<String> = [&first, &second, &third]
            .iter()
            .map(|c| c.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| n.starts_with("feed_") && n.ends_with(".ts")));
        assert_eq!(names.len(), 3);
        assert_ne!(names[0], names[1]);
        assert_ne!(names[1], names[2]);
        assert_ne!(names[0], names[2]);
    }

    #[test]
    fn test_close_without_writes_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel::bounded(4);
        let muxer = SegmentingMuxer::new(dir.path(), Duration::from_secs(8), tx, ActiveSegment::new());
        assert!(muxer.close().unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_directory_is_a_create_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel::bounded(4);
        let mut muxer = SegmentingMuxer::new(
            dir.path().join("missing"),
            Duration::from_secs(8),
            tx,
            ActiveSegment::new(),
        );
        let err = muxer.encode(&key_au(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, MuxError::CreateFile { .. }));
    }
}
