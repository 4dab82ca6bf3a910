// src/retention/mod.rs
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use crossbeam::channel::{Sender, tick};
use crossbeam::select;

use crate::config::StorerConfig;
use crate::core::{Component, ComponentLogger, LogContext, StopSignal};
use crate::events::CleanedRecord;
use crate::recorder::ActiveSegment;

pub mod retention_fs;

pub use retention_fs::{FsRetention, SweepReport};

pub trait RetentionPolicy: Send {
    fn sweep(&mut self) -> io::Result<SweepReport>;
}

/// Runs a [`RetentionPolicy`] on a fixed period until stopped.
pub struct RetentionEngine {
    dir: PathBuf,
    backup_dir: Option<PathBuf>,
    period: Duration,
    policy: Option<Box<dyn RetentionPolicy>>,
    stop: StopSignal,
    thread_handle: Option<JoinHandle<Box<dyn RetentionPolicy>>>,
}

impl RetentionEngine {
    pub fn new(
        recordings_dir: PathBuf,
        cfg: &StorerConfig,
        cleaned: Sender<CleanedRecord>,
        active: ActiveSegment,
    ) -> Self {
        let policy = FsRetention::new(
            recordings_dir.clone(),
            cfg.backup_dir.clone(),
            cfg.size_limit_bytes,
            cleaned,
            active,
        );
        Self::with_policy(
            recordings_dir,
            cfg.backup_dir.clone(),
            cfg.check_period(),
            Box::new(policy),
        )
    }

    pub fn with_policy(
        dir: PathBuf,
        backup_dir: Option<PathBuf>,
        period: Duration,
        policy: Box<dyn RetentionPolicy>,
    ) -> Self {
        Self {
            dir,
            backup_dir,
            period,
            policy: Some(policy),
            stop: StopSignal::new(),
            thread_handle: None,
        }
    }
}

impl ComponentLogger for RetentionEngine {
    fn log_context(&self) -> LogContext {
        LogContext::new("Retention", &self.dir.display().to_string())
    }
}

impl Component for RetentionEngine {
    fn name(&self) -> &str {
        "retention"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create watched dir {}", self.dir.display()))?;
        match &self.backup_dir {
            Some(backup) => {
                fs::create_dir_all(backup)
                    .with_context(|| format!("create backup dir {}", backup.display()))?;
                self.info(&format!("evicted files move to {}", backup.display()));
            }
            None => self.warn("no backup dir configured, evicted files will be erased"),
        }

        let mut policy = self
            .policy
            .take()
            .context("retention engine cannot be restarted after stop")?;
        self.stop = StopSignal::new();
        let stop = self.stop.clone();
        let ticker = tick(self.period);

        let handle = std::thread::Builder::new()
            .name("retention".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => match policy.sweep() {
                            Ok(report) if !report.evicted.is_empty() => log::info!(
                                "[retention] evicted {} file(s), {} -> {} bytes",
                                report.evicted.len(),
                                report.total_before,
                                report.total_after
                            ),
                            Ok(_) => {}
                            Err(e) => log::error!("[retention] sweep failed: {}", e),
                        },
                        recv(stop.receiver()) -> _ => break,
                    }
                }
                policy
            })
            .context("spawn retention thread")?;

        self.thread_handle = Some(handle);
        self.info(&format!("sweeping every {:?}", self.period));
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.stop.trigger();
        if let Some(handle) = self.thread_handle.take() {
            let policy = handle
                .join()
                .map_err(|_| anyhow::anyhow!("retention thread panicked"))?;
            self.policy = Some(policy);
            self.info("stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPolicy(Arc<AtomicUsize>);

    impl RetentionPolicy for CountingPolicy {
        fn sweep(&mut self) -> io::Result<SweepReport> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("listing failed"))
        }
    }

    #[test]
    fn test_failed_sweeps_do_not_end_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let mut engine = RetentionEngine::with_policy(
            dir.path().to_path_buf(),
            None,
            Duration::from_millis(10),
            Box::new(CountingPolicy(count.clone())),
        );

        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        engine.stop().unwrap();

        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_start_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("rec");
        let backup = dir.path().join("backup");
        let (tx, _rx) = crossbeam::channel::bounded(1);
        let cfg = StorerConfig {
            backup_dir: Some(backup.clone()),
            ..Default::default()
        };
        let mut engine = RetentionEngine::new(watched.clone(), &cfg, tx, ActiveSegment::new());

        engine.start().unwrap();
        assert!(watched.is_dir());
        assert!(backup.is_dir());
        engine.stop().unwrap();
        // stop is idempotent
        engine.stop().unwrap();
    }
}
