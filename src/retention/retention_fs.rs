// src/retention/retention_fs.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crossbeam::channel::Sender;

use super::RetentionPolicy;
use crate::events::{CleanStatus, CleanedRecord, Delivery, offer};
use crate::recorder::ActiveSegment;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub total_before: u64,
    pub total_after: u64,
    pub evicted: Vec<CleanedRecord>,
}

struct Entry {
    path: PathBuf,
    name: String,
    size: u64,
    modified: SystemTime,
}

/// Keeps the files of one directory under a byte budget, oldest first.
pub struct FsRetention {
    dir: PathBuf,
    backup_dir: Option<PathBuf>,
    size_limit: u64,
    cleaned: Sender<CleanedRecord>,
    active: ActiveSegment,
}

impl FsRetention {
    pub fn new(
        dir: PathBuf,
        backup_dir: Option<PathBuf>,
        size_limit: u64,
        cleaned: Sender<CleanedRecord>,
        active: ActiveSegment,
    ) -> Self {
        Self {
            dir,
            backup_dir,
            size_limit,
            cleaned,
            active,
        }
    }

    fn list(&self) -> io::Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    log::warn!("[retention] unreadable entry in {}: {}", self.dir.display(), err);
                    continue;
                }
            };
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    log::warn!("[retention] skip {:?}: {}", path, err);
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            let modified = match meta.modified() {
                Ok(t) => t,
                Err(err) => {
                    log::warn!("[retention] skip {:?}: {}", path, err);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(Entry {
                path,
                name,
                size: meta.len(),
                modified,
            });
        }
        Ok(entries)
    }

    fn evict(&self, entry: &Entry) -> io::Result<CleanStatus> {
        match &self.backup_dir {
            Some(backup) => {
                move_file(&entry.path, &backup.join(&entry.name))?;
                Ok(CleanStatus::Moved)
            }
            None => {
                fs::remove_file(&entry.path)?;
                Ok(CleanStatus::Erased)
            }
        }
    }
}

impl RetentionPolicy for FsRetention {
    fn sweep(&mut self) -> io::Result<SweepReport> {
        let mut entries = self.list()?;
        // stable: equal mtimes keep listing order
        entries.sort_by_key(|e| e.modified);

        let total_before: u64 = entries.iter().map(|e| e.size).sum();
        let mut total = total_before;
        let mut evicted = Vec::new();

        for entry in &entries {
            if total <= self.size_limit {
                break;
            }
            if self.active.is_active(&entry.path) {
                log::debug!("[retention] {} is being written, skipped", entry.name);
                continue;
            }

            let status = match self.evict(entry) {
                Ok(status) => status,
                Err(err) => {
                    log::error!("[retention] failed {:?}: {}", entry.path, err);
                    continue;
                }
            };
            total -= entry.size;

            let record = CleanedRecord {
                filename: entry.name.clone(),
                size_bytes: entry.size,
                status,
            };
            log::info!(
                "[retention] {:?} {} ({} bytes)",
                record.status,
                record.filename,
                record.size_bytes
            );
            match offer(&self.cleaned, record.clone()) {
                Delivery::Sent => {}
                Delivery::Full => log::warn!("[retention] cleaned mailbox full, event dropped"),
                Delivery::Closed => log::debug!("[retention] cleaned mailbox closed"),
            }
            evicted.push(record);
        }

        Ok(SweepReport {
            total_before,
            total_after: total,
            evicted,
        })
    }
}

/// `rename`, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    move_with(from, to, |a, b| fs::rename(a, b))
}

fn move_with<F>(from: &Path, to: &Path, rename: F) -> io::Result<()>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(err) => Err(err),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    fn write_file(dir: &Path, name: &str, size: usize, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; size]).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    #[test]
    fn test_under_budget_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.ts", 10, 30);
        let (tx, rx) = channel::bounded(4);
        let mut r = FsRetention::new(dir.path().into(), None, 100, tx, ActiveSegment::new());

        let report = r.sweep().unwrap();
        assert_eq!(report.total_before, 10);
        assert_eq!(report.total_after, 10);
        assert!(report.evicted.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subdirectories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        write_file(&dir.path().join("nested"), "big.ts", 500, 100);
        write_file(dir.path(), "a.ts", 10, 30);
        let (tx, _rx) = channel::bounded(4);
        let mut r = FsRetention::new(dir.path().into(), None, 50, tx, ActiveSegment::new());

        let report = r.sweep().unwrap();
        assert_eq!(report.total_before, 10);
        assert!(dir.path().join("nested/big.ts").exists());
    }

    #[test]
    fn test_active_chunk_is_never_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = write_file(dir.path(), "open.ts", 100, 300);
        write_file(dir.path(), "closed.ts", 100, 200);
        let active = ActiveSegment::new();
        active.set(Some(oldest.clone()));
        let (tx, _rx) = channel::bounded(4);
        let mut r = FsRetention::new(dir.path().into(), None, 150, tx, active);

        let report = r.sweep().unwrap();
        assert!(oldest.exists());
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].filename, "closed.ts");
        assert_eq!(report.total_after, 100);
    }

    #[test]
    fn test_full_mailbox_does_not_stop_eviction() {
        let dir = tempfile::tempdir().unwrap();
        for (i, age) in [500u64, 400, 300].iter().enumerate() {
            write_file(dir.path(), &format!("f{}.ts", i), 100, *age);
        }
        let (tx, rx) = channel::bounded(1);
        let mut r = FsRetention::new(dir.path().into(), None, 100, tx, ActiveSegment::new());

        let report = r.sweep().unwrap();
        assert_eq!(report.evicted.len(), 2);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.recv().unwrap().filename, "f0.ts");
    }

    #[test]
    fn test_cross_device_move_copies_then_removes() {
        let dir = tempfile::tempdir().unwrap();
        let from = write_file(dir.path(), "a.ts", 42, 10);
        let to = dir.path().join("b.ts");

        move_with(&from, &to, |_, _| Err(io::Error::from(io::ErrorKind::CrossesDevices))).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::metadata(&to).unwrap().len(), 42);
    }

    #[test]
    fn test_other_rename_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let from = write_file(dir.path(), "a.ts", 42, 10);
        let to = dir.path().join("b.ts");

        let err = move_with(&from, &to, |_, _| {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(from.exists());
        assert!(!to.exists());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel::bounded(1);
        let mut r = FsRetention::new(dir.path().join("nope"), None, 1, tx, ActiveSegment::new());
        assert!(r.sweep().is_err());
    }
}
