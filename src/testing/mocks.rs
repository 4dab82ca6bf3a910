use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::consumers::Indexer;
use crate::core::lock::lock_mutex;
use crate::core::{Component, StopSignal};
use crate::events::SegmentRecord;
use crate::recorder::Recording;

/// Lifecycle calls in the order they happened, e.g. `"start:recorder"`.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    lock_mutex(log, "mocks::events").clone()
}

fn record(log: &EventLog, event: String) {
    lock_mutex(log, "mocks::record").push(event);
}

pub struct MockComponent {
    name: String,
    log: EventLog,
    fail_start: bool,
}

impl MockComponent {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            fail_start: false,
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

impl Component for MockComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        record(&self.log, format!("start:{}", self.name));
        if self.fail_start {
            bail!("{} refused to start", self.name);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        record(&self.log, format!("stop:{}", self.name));
        Ok(())
    }
}

/// Recorder stand-in whose session end is driven by the test.
pub struct MockRecorder {
    inner: MockComponent,
    finished: StopSignal,
    final_segment: Option<SegmentRecord>,
    stop_error: Option<String>,
}

impl MockRecorder {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: MockComponent::new("recorder", log),
            finished: StopSignal::new(),
            final_segment: None,
            stop_error: None,
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.inner = self.inner.failing_start();
        self
    }

    pub fn with_final_segment(mut self, record: SegmentRecord) -> Self {
        self.final_segment = Some(record);
        self
    }

    /// `stop` returns this error, like a session that died on I/O.
    pub fn with_stop_error(mut self, message: &str) -> Self {
        self.stop_error = Some(message.to_string());
        self
    }

    /// Trigger to simulate the session ending on its own.
    pub fn session_end(&self) -> StopSignal {
        self.finished.clone()
    }
}

impl Component for MockRecorder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.stop()?;
        match &self.stop_error {
            Some(message) => bail!("{}", message),
            None => Ok(()),
        }
    }
}

impl Recording for MockRecorder {
    fn finished(&self) -> StopSignal {
        self.finished.clone()
    }

    fn take_final_segment(&mut self) -> Option<SegmentRecord> {
        self.final_segment.take()
    }
}

pub struct MockIndexer {
    inner: MockComponent,
    indexed: Arc<Mutex<Vec<SegmentRecord>>>,
}

impl MockIndexer {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: MockComponent::new("indexer", log),
            indexed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.inner = self.inner.failing_start();
        self
    }

    pub fn indexed(&self) -> Arc<Mutex<Vec<SegmentRecord>>> {
        self.indexed.clone()
    }
}

impl Component for MockIndexer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.stop()
    }
}

impl Indexer for MockIndexer {
    fn index_segment(&mut self, segment: SegmentRecord) -> Result<()> {
        record(
            &self.inner.log,
            format!("index:{}", segment.path.display()),
        );
        lock_mutex(&self.indexed, "MockIndexer::index_segment").push(segment);
        Ok(())
    }

    fn drain_pending(&mut self) -> Result<usize> {
        record(&self.inner.log, "drain:indexer".to_string());
        Ok(0)
    }
}
