// src/coordinator.rs
//! Wires the pipeline together and owns its lifecycle.

use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;

use crate::config::Config;
use crate::consumers::{Indexer, JsonlIndexer, KeyframeRecognizer};
use crate::core::Component;
use crate::events::{self, SegmentRecord};
use crate::recorder::{ActiveSegment, Recorder, Recording};
use crate::retention::RetentionEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// OS signal (SIGINT, SIGTERM or SIGHUP).
    Interrupted,
    /// [`CoordinatorHandle::cancel`].
    Cancelled,
    /// The recorder's session ended on its own.
    SessionEnded,
}

#[derive(Debug)]
pub struct RunReport {
    pub reason: StopReason,
    pub final_segment: Option<SegmentRecord>,
    pub recorder_error: Option<anyhow::Error>,
}

/// Cloneable trigger for ending [`Coordinator::run`] from elsewhere.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: Sender<StopReason>,
}

impl CoordinatorHandle {
    pub fn cancel(&self) {
        let _ = self.tx.try_send(StopReason::Cancelled);
    }

    pub fn interrupt(&self) {
        let _ = self.tx.try_send(StopReason::Interrupted);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Recorder,
    Recognizer,
    Retention,
    Indexer,
}

const START_ORDER: [Slot; 4] = [Slot::Recorder, Slot::Recognizer, Slot::Retention, Slot::Indexer];
const STOP_ORDER: [Slot; 4] = [Slot::Recognizer, Slot::Indexer, Slot::Recorder, Slot::Retention];

pub struct Coordinator {
    recorder: Box<dyn Recording>,
    recognizer: Option<Box<dyn Component>>,
    retention: Box<dyn Component>,
    indexer: Box<dyn Indexer>,
    reason_tx: Sender<StopReason>,
    reason_rx: Receiver<StopReason>,
}

impl Coordinator {
    pub fn new(
        recorder: Box<dyn Recording>,
        recognizer: Option<Box<dyn Component>>,
        retention: Box<dyn Component>,
        indexer: Box<dyn Indexer>,
    ) -> Self {
        let (reason_tx, reason_rx) = channel::bounded(4);
        Self {
            recorder,
            recognizer,
            retention,
            indexer,
            reason_tx,
            reason_rx,
        }
    }

    /// Builds the production pipeline: every mailbox bounded as configured.
    pub fn from_config(cfg: &Config) -> Self {
        let (tx, rx) = events::channels(&cfg.channels);
        let active = ActiveSegment::new();

        let mut frame_subscribers = Vec::new();
        let recognizer: Option<Box<dyn Component>> = if cfg.recognizer.enabled {
            frame_subscribers.push(tx.frames.clone());
            Some(Box::new(KeyframeRecognizer::new(
                &cfg.recognizer,
                rx.frames.clone(),
                tx.recognitions.clone(),
            )))
        } else {
            None
        };

        let recorder = Recorder::new(
            cfg.recorder.clone(),
            tx.segments.clone(),
            frame_subscribers,
            active.clone(),
        );
        let retention = RetentionEngine::new(
            cfg.recorder.recordings_dir.clone(),
            &cfg.storer,
            tx.cleaned.clone(),
            active,
        );
        let indexer = JsonlIndexer::new(&cfg.indexer, rx.segments, rx.recognitions, rx.cleaned);

        Self::new(
            Box::new(recorder),
            recognizer,
            Box::new(retention),
            Box::new(indexer),
        )
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.reason_tx.clone(),
        }
    }

    /// Routes SIGINT, SIGTERM and SIGHUP to [`CoordinatorHandle::interrupt`]. Process-wide,
    /// so only the binary calls it.
    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        let handle = self.handle();
        ctrlc::set_handler(move || {
            log::info!("[coordinator] shutdown requested");
            handle.interrupt();
        })
        .context("install signal handler")
    }

    /// Starts everything, blocks until a stop reason arrives, then stops
    /// everything. Fails only when startup fails.
    pub fn run(mut self) -> anyhow::Result<RunReport> {
        self.start_all()?;
        log::info!("[coordinator] pipeline running");

        let finished = self.recorder.finished();
        let reason = select! {
            recv(self.reason_rx) -> msg => msg.unwrap_or(StopReason::Cancelled),
            recv(finished.receiver()) -> _ => StopReason::SessionEnded,
        };
        log::info!("[coordinator] stopping: {:?}", reason);

        Ok(self.stop_all(reason))
    }

    fn start_all(&mut self) -> anyhow::Result<()> {
        let mut started = Vec::with_capacity(START_ORDER.len());
        for slot in START_ORDER {
            let Some((name, result)) = self.start_slot(slot) else {
                continue;
            };
            if let Err(e) = result {
                log::error!("[coordinator] {} failed to start: {:#}", name, e);
                for prev in started.into_iter().rev() {
                    if let Some((name, Err(stop_err))) = self.stop_slot(prev) {
                        log::error!("[coordinator] {} failed to stop: {:#}", name, stop_err);
                    }
                }
                return Err(e.context(format!("start {}", name)));
            }
            log::info!("[coordinator] {} started", name);
            started.push(slot);
        }
        Ok(())
    }

    fn stop_all(&mut self, reason: StopReason) -> RunReport {
        let mut recorder_error = None;
        for slot in STOP_ORDER {
            match self.stop_slot(slot) {
                Some((_, Err(e))) if slot == Slot::Recorder => {
                    log::warn!("[coordinator] recorder ended with: {:#}", e);
                    recorder_error = Some(e);
                }
                Some((name, Err(e))) => {
                    log::error!("[coordinator] {} failed to stop: {:#}", name, e)
                }
                Some((name, Ok(()))) => log::debug!("[coordinator] {} stopped", name),
                None => {}
            }
        }

        // rollovers during recorder drain and a sweep still in flight
        match self.indexer.drain_pending() {
            Ok(0) => {}
            Ok(n) => log::info!("[coordinator] indexed {} event(s) produced during shutdown", n),
            Err(e) => log::error!("[coordinator] could not index late events: {:#}", e),
        }

        let final_segment = self.recorder.take_final_segment();
        if let Some(record) = &final_segment {
            if let Err(e) = self.indexer.index_segment(record.clone()) {
                log::error!(
                    "[coordinator] could not index final segment {}: {:#}",
                    record.path.display(),
                    e
                );
            }
        }

        RunReport {
            reason,
            final_segment,
            recorder_error,
        }
    }

    fn start_slot(&mut self, slot: Slot) -> Option<(String, anyhow::Result<()>)> {
        match slot {
            Slot::Recorder => Some((self.recorder.name().to_string(), self.recorder.start())),
            Slot::Recognizer => self
                .recognizer
                .as_mut()
                .map(|c| (c.name().to_string(), c.start())),
            Slot::Retention => Some((self.retention.name().to_string(), self.retention.start())),
            Slot::Indexer => Some((self.indexer.name().to_string(), self.indexer.start())),
        }
    }

    fn stop_slot(&mut self, slot: Slot) -> Option<(String, anyhow::Result<()>)> {
        match slot {
            Slot::Recorder => Some((self.recorder.name().to_string(), self.recorder.stop())),
            Slot::Recognizer => self
                .recognizer
                .as_mut()
                .map(|c| (c.name().to_string(), c.stop())),
            Slot::Retention => Some((self.retention.name().to_string(), self.retention.stop())),
            Slot::Indexer => Some((self.indexer.name().to_string(), self.indexer.stop())),
        }
    }
}
