// src/events.rs
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::recorder::fanout::VideoFrame;

/// One closed chunk file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanStatus {
    Unchanged,
    Moved,
    Erased,
}

/// One file evicted by a retention sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub filename: String,
    pub size_bytes: u64,
    pub status: CleanStatus,
}

/// Produced by a frame consumer when it recognised something worth indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizedRecord {
    pub path: PathBuf,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a non-blocking mailbox send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Full,
    Closed,
}

/// Non-blocking send; a full or closed mailbox drops the item.
pub fn offer<T>(tx: &Sender<T>, item: T) -> Delivery {
    match tx.try_send(item) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(_)) => Delivery::Full,
        Err(TrySendError::Disconnected(_)) => Delivery::Closed,
    }
}

/// Producer ends handed to components at construction.
#[derive(Clone)]
pub struct EventSenders {
    pub segments: Sender<SegmentRecord>,
    pub frames: Sender<VideoFrame>,
    pub recognitions: Sender<RecognizedRecord>,
    pub cleaned: Sender<CleanedRecord>,
}

/// Consumer ends handed to components at construction.
#[derive(Clone)]
pub struct EventReceivers {
    pub segments: Receiver<SegmentRecord>,
    pub frames: Receiver<VideoFrame>,
    pub recognitions: Receiver<RecognizedRecord>,
    pub cleaned: Receiver<CleanedRecord>,
}

/// Creates every inter-component mailbox, all bounded.
pub fn channels(cfg: &ChannelConfig) -> (EventSenders, EventReceivers) {
    let (segments_tx, segments_rx) = channel::bounded(cfg.segment);
    let (frames_tx, frames_rx) = channel::bounded(cfg.frames);
    let (recog_tx, recog_rx) = channel::bounded(cfg.recognition);
    let (cleaned_tx, cleaned_rx) = channel::bounded(cfg.cleaned);

    (
        EventSenders {
            segments: segments_tx,
            frames: frames_tx,
            recognitions: recog_tx,
            cleaned: cleaned_tx,
        },
        EventReceivers {
            segments: segments_rx,
            frames: frames_rx,
            recognitions: recog_rx,
            cleaned: cleaned_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_reports_full_and_closed() {
        let (tx, rx) = channel::bounded::<u8>(1);
        assert_eq!(offer(&tx, 1), Delivery::Sent);
        assert_eq!(offer(&tx, 2), Delivery::Full);
        drop(rx);
        assert_eq!(offer(&tx, 3), Delivery::Closed);
    }

    #[test]
    fn test_channels_use_configured_capacities() {
        let cfg = ChannelConfig {
            segment: 2,
            frames: 3,
            recognition: 4,
            cleaned: 5,
        };
        let (tx, _rx) = channels(&cfg);
        assert_eq!(tx.segments.capacity(), Some(2));
        assert_eq!(tx.frames.capacity(), Some(3));
        assert_eq!(tx.recognitions.capacity(), Some(4));
        assert_eq!(tx.cleaned.capacity(), Some(5));
    }

    #[test]
    fn test_clean_status_serializes_snake_case() {
        let record = CleanedRecord {
            filename: "feed.ts".into(),
            size_bytes: 10,
            status: CleanStatus::Erased,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"erased\""));
    }
}
