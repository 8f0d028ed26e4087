//! Single-writer lock for one table directory.
//!
//! The lock is a file created with `create_new`, so only one writer can hold
//! it. A lock older than its TTL is assumed abandoned by a crashed run and is
//! taken over: the stale file is renamed aside, checked to still be the lock
//! that was judged stale, and only then replaced with `create_new`. Dropping
//! the guard releases it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default lock TTL (6 hours).
pub const DEFAULT_LOCK_TTL: TimeDelta = TimeDelta::hours(6);

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub operation: String,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        let seq = HOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            holder_id: format!("{}-{}", std::process::id(), seq),
            acquired_at: Utc::now(),
            operation: operation.to_string(),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now - self.acquired_at > ttl
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct TableLock {
    path: PathBuf,
    info: LockInfo,
}

impl TableLock {
    pub fn acquire(path: &Path, operation: &str, ttl: TimeDelta) -> Result<Self> {
        let info = LockInfo::new(operation);

        match write_new(path, &info) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = read_lock(path)?;
                if !existing.is_stale(Utc::now(), ttl) {
                    bail!(
                        "{} is locked by {} ({}) since {}",
                        path.display(),
                        existing.holder_id,
                        existing.operation,
                        existing.acquired_at
                    );
                }
                warn!(
                    path = %path.display(),
                    holder = %existing.holder_id,
                    acquired_at = %existing.acquired_at,
                    "Taking over stale table lock"
                );
                take_over(path, &existing, &info)?;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("creating lock {}", path.display()));
            }
        }

        debug!(path = %path.display(), holder = %info.holder_id, "Table lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    pub fn holder_id(&self) -> &str {
        &self.info.holder_id
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        // leave the file alone if another writer took it over
        match read_lock(&self.path) {
            Ok(current) if current.holder_id == self.info.holder_id => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to release table lock");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "Table lock already gone"),
        }
    }
}

/// Replaces the stale lock `seen` with `info`. Fails without disturbing the
/// current holder if another writer replaced `seen` first.
fn take_over(path: &Path, seen: &LockInfo, info: &LockInfo) -> Result<()> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".stale-{}", info.holder_id));
    let aside = PathBuf::from(aside);

    match fs::rename(path, &aside) {
        Ok(()) => {
            let moved = read_lock(&aside);
            if !matches!(&moved, Ok(m) if m.holder_id == seen.holder_id) {
                // a fresh lock: put it back unless yet another writer got in
                let restored = fs::hard_link(&aside, path);
                let _ = fs::remove_file(&aside);
                restored.with_context(|| format!("restoring lock {}", path.display()))?;
                bail!(
                    "{} was taken over by another writer while replacing stale holder {}",
                    path.display(),
                    seen.holder_id
                );
            }
            fs::remove_file(&aside)
                .with_context(|| format!("removing stale lock {}", aside.display()))?;
        }
        // already removed by a competing writer; create_new decides
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("moving stale lock {}", path.display())),
    }

    match write_new(path, info) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let holder = read_lock(path).map(|l| l.holder_id).unwrap_or_default();
            bail!("{} was taken over by {holder}", path.display())
        }
        Err(e) => Err(e).with_context(|| format!("re-acquiring lock {}", path.display())),
    }
}

fn write_new(path: &Path, info: &LockInfo) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = serde_json::to_vec(info)?;
    file.write_all(&body)?;
    file.sync_all()
}

fn read_lock(path: &Path) -> Result<LockInfo> {
    let body = fs::read(path).with_context(|| format!("reading lock {}", path.display()))?;
    serde_json::from_slice(&body).with_context(|| format!("parsing lock {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("transit_reliability_lock_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir.join("_lock")
    }

    #[test]
    fn test_second_writer_is_rejected() {
        let path = lock_path("reject");
        let first = TableLock::acquire(&path, "resolve", DEFAULT_LOCK_TTL).unwrap();

        let second = TableLock::acquire(&path, "resolve", DEFAULT_LOCK_TTL);
        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains(first.holder_id()));
    }

    #[test]
    fn test_drop_releases() {
        let path = lock_path("release");
        {
            let _lock = TableLock::acquire(&path, "resolve", DEFAULT_LOCK_TTL).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        assert!(TableLock::acquire(&path, "resolve", DEFAULT_LOCK_TTL).is_ok());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let path = lock_path("stale");
        let stale = LockInfo {
            holder_id: "crashed-run".to_string(),
            acquired_at: Utc::now() - TimeDelta::hours(7),
            operation: "resolve".to_string(),
        };
        write_new(&path, &stale).unwrap();

        let lock = TableLock::acquire(&path, "resolve", DEFAULT_LOCK_TTL).unwrap();
        assert_ne!(lock.holder_id(), "crashed-run");
        assert_eq!(read_lock(&path).unwrap().holder_id, lock.holder_id());
    }

    #[test]
    fn test_takeover_loses_to_writer_that_replaced_stale_lock_first() {
        let path = lock_path("takeover_race");
        let stale = LockInfo {
            holder_id: "crashed-run".to_string(),
            acquired_at: Utc::now() - TimeDelta::hours(7),
            operation: "resolve".to_string(),
        };
        // both writers saw `stale`; the first already replaced it
        let first = TableLock::acquire(&path, "resolve", DEFAULT_LOCK_TTL).unwrap();

        let late = LockInfo::new("aggregate");
        let err = take_over(&path, &stale, &late).unwrap_err();

        assert!(err.to_string().contains("taken over"));
        assert_eq!(read_lock(&path).unwrap().holder_id, first.holder_id());
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".stale-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_takeover_after_stale_lock_vanished() {
        let path = lock_path("takeover_vanished");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let stale = LockInfo {
            holder_id: "crashed-run".to_string(),
            acquired_at: Utc::now() - TimeDelta::hours(7),
            operation: "resolve".to_string(),
        };
        let info = LockInfo::new("resolve");

        take_over(&path, &stale, &info).unwrap();
        assert_eq!(read_lock(&path).unwrap().holder_id, info.holder_id);
    }
}
