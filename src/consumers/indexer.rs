// src/consumers/indexer.rs
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context, anyhow};
use crossbeam::channel::{Receiver, never};
use crossbeam::select;
use serde::Serialize;

use super::Indexer;
use crate::config::IndexerConfig;
use crate::core::{Component, ComponentLogger, LogContext, StopSignal};
use crate::events::{CleanedRecord, RecognizedRecord, SegmentRecord};

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum IndexEntry<'a> {
    Segment(&'a SegmentRecord),
    Recognition(&'a RecognizedRecord),
    Cleaned(&'a CleanedRecord),
}

struct IndexFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl IndexFile {
    fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create index dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open index {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, entry: &IndexEntry<'_>) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        // one line per event, visible to readers right away
        self.writer.flush()?;
        Ok(())
    }
}

struct Inbox {
    segments: Receiver<SegmentRecord>,
    recognitions: Receiver<RecognizedRecord>,
    cleaned: Receiver<CleanedRecord>,
}

/// Appends every pipeline event to a JSON-lines file.
pub struct JsonlIndexer {
    path: PathBuf,
    inbox: Option<Inbox>,
    file: Option<IndexFile>,
    entries: Arc<AtomicU64>,
    stop: StopSignal,
    thread_handle: Option<JoinHandle<(Inbox, IndexFile)>>,
}

impl JsonlIndexer {
    pub fn new(
        cfg: &IndexerConfig,
        segments: Receiver<SegmentRecord>,
        recognitions: Receiver<RecognizedRecord>,
        cleaned: Receiver<CleanedRecord>,
    ) -> Self {
        Self {
            path: cfg.index_path.clone(),
            inbox: Some(Inbox {
                segments,
                recognitions,
                cleaned,
            }),
            file: None,
            entries: Arc::new(AtomicU64::new(0)),
            stop: StopSignal::new(),
            thread_handle: None,
        }
    }

    pub fn entries_written(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    fn file(&mut self) -> anyhow::Result<&mut IndexFile> {
        if self.file.is_none() {
            self.file = Some(IndexFile::open(&self.path)?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| anyhow!("index file unavailable"))
    }
}

impl ComponentLogger for JsonlIndexer {
    fn log_context(&self) -> LogContext {
        LogContext::new("Indexer", &self.path.display().to_string())
    }
}

impl Component for JsonlIndexer {
    fn name(&self) -> &str {
        "indexer"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }

        let file = match self.file.take() {
            Some(file) => file,
            None => IndexFile::open(&self.path)?,
        };
        let inbox = self
            .inbox
            .take()
            .ok_or_else(|| anyhow!("indexer mailboxes already consumed"))?;
        self.stop = StopSignal::new();
        let stop = self.stop.clone();
        let entries = self.entries.clone();

        let handle = std::thread::Builder::new()
            .name("indexer".into())
            .spawn(move || drain(inbox, file, stop, entries))
            .context("spawn indexer thread")?;

        self.thread_handle = Some(handle);
        self.info("indexing");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.stop.trigger();
        if let Some(handle) = self.thread_handle.take() {
            let (inbox, file) = handle
                .join()
                .map_err(|_| anyhow!("indexer thread panicked"))?;
            self.inbox = Some(inbox);
            self.file = Some(file);
            self.info(&format!("stopped after {} entries", self.entries_written()));
        }
        Ok(())
    }
}

impl Indexer for JsonlIndexer {
    fn index_segment(&mut self, record: SegmentRecord) -> anyhow::Result<()> {
        if self.thread_handle.is_some() {
            return Err(anyhow!("index_segment called while the indexer thread owns the file"));
        }
        self.file()?.append(&IndexEntry::Segment(&record))?;
        self.entries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn drain_pending(&mut self) -> anyhow::Result<usize> {
        if self.thread_handle.is_some() {
            return Err(anyhow!("drain_pending called while the indexer thread is running"));
        }
        let Some(inbox) = self.inbox.take() else {
            return Ok(0);
        };
        let file = match self.file() {
            Ok(file) => file,
            Err(e) => {
                self.inbox = Some(inbox);
                return Err(e);
            }
        };

        let mut written = 0;
        let mut result = Ok(());
        let entries = inbox
            .segments
            .try_iter()
            .map(Late::Segment)
            .chain(inbox.recognitions.try_iter().map(Late::Recognition))
            .chain(inbox.cleaned.try_iter().map(Late::Cleaned));
        for late in entries {
            if let Err(e) = file.append(&late.entry()) {
                result = Err(e);
                break;
            }
            written += 1;
        }
        self.inbox = Some(inbox);
        self.entries.fetch_add(written as u64, Ordering::Relaxed);
        if written > 0 {
            self.info(&format!("indexed {} late entries", written));
        }
        result.map(|()| written)
    }
}

/// Owned form of an entry, for records pulled after the worker exited.
enum Late {
    Segment(SegmentRecord),
    Recognition(RecognizedRecord),
    Cleaned(CleanedRecord),
}

impl Late {
    fn entry(&self) -> IndexEntry<'_> {
        match self {
            Late::Segment(r) => IndexEntry::Segment(r),
            Late::Recognition(r) => IndexEntry::Recognition(r),
            Late::Cleaned(r) => IndexEntry::Cleaned(r),
        }
    }
}

fn drain(
    inbox: Inbox,
    mut file: IndexFile,
    stop: StopSignal,
    entries: Arc<AtomicU64>,
) -> (Inbox, IndexFile) {
    let mut write = |entry: IndexEntry<'_>| match file.append(&entry) {
        Ok(()) => {
            entries.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => log::error!("[indexer] write {} failed: {:#}", file.path.display(), e),
    };

    // a closed mailbox is parked on `never()` so select does not spin on it
    let mut segments = inbox.segments.clone();
    let mut recognitions = inbox.recognitions.clone();
    let mut cleaned = inbox.cleaned.clone();

    loop {
        let mut closed = [false; 3];
        select! {
            recv(segments) -> msg => match msg {
                Ok(record) => write(IndexEntry::Segment(&record)),
                Err(_) => closed[0] = true,
            },
            recv(recognitions) -> msg => match msg {
                Ok(record) => write(IndexEntry::Recognition(&record)),
                Err(_) => closed[1] = true,
            },
            recv(cleaned) -> msg => match msg {
                Ok(record) => write(IndexEntry::Cleaned(&record)),
                Err(_) => closed[2] = true,
            },
            recv(stop.receiver()) -> _ => break,
        }
        if closed[0] {
            segments = never();
        }
        if closed[1] {
            recognitions = never();
        }
        if closed[2] {
            cleaned = never();
        }
    }

    // whatever was already queued still gets indexed
    for record in inbox.segments.try_iter() {
        write(IndexEntry::Segment(&record));
    }
    for record in inbox.recognitions.try_iter() {
        write(IndexEntry::Recognition(&record));
    }
    for record in inbox.cleaned.try_iter() {
        write(IndexEntry::Cleaned(&record));
    }
    drop(write);

    (inbox, file)
}
