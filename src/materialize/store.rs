//! File-backed tables partitioned by service date.
//!
//! ## Layout
//!
//! ```text
//! {root}/{table}/_manifest.json
//! {root}/{table}/_lock
//! {root}/{table}/_last_run.json
//! {root}/{table}/service_date=YYYY-MM-DD/part-{version}.csv
//! {root}/{table}/all/part-{version}.csv            (unpartitioned tables)
//! ```
//!
//! Readers only see files named by the manifest. A replace stages new
//! partition files first and then swaps the manifest with a rename, so a run
//! that fails before the swap leaves the previous table state visible and
//! intact. After the swap every partition or temp file the new manifest does
//! not name is removed, including leftovers from runs that died mid-stage.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::materialize::lock::{DEFAULT_LOCK_TTL, TableLock};
use crate::materialize::window::{RunMode, ServiceWindow};

const MANIFEST_FILE: &str = "_manifest.json";
const LOCK_FILE: &str = "_lock";
const LAST_RUN_FILE: &str = "_last_run.json";
const PARTITION_PREFIX: &str = "service_date=";
const UNPARTITIONED: &str = "all";

/// A row type stored in a [`TableStore`].
pub trait TableRow: Serialize + DeserializeOwned {
    /// Directory name under the store root.
    const TABLE: &'static str;

    /// Service date partition, `None` for unpartitioned tables.
    fn partition_date(&self) -> Option<NaiveDate>;

    /// Order of rows inside a partition file.
    fn row_order(&self, other: &Self) -> Ordering;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub file: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableManifest {
    pub table: String,
    pub version: u64,
    pub committed_at: Option<DateTime<Utc>>,
    pub partitions: BTreeMap<String, PartitionEntry>,
}

impl TableManifest {
    pub fn row_count(&self) -> usize {
        self.partitions.values().map(|p| p.rows).sum()
    }

    pub fn partition_dates(&self) -> Vec<NaiveDate> {
        self.partitions.keys().filter_map(|label| parse_label(label)).collect()
    }
}

/// Which existing partitions a replace discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceScope {
    /// Every service-date partition inside the window.
    Window(ServiceWindow),
    /// The whole table.
    All,
}

impl ReplaceScope {
    fn covers_label(&self, label: &str) -> bool {
        match self {
            ReplaceScope::All => true,
            ReplaceScope::Window(window) => parse_label(label).is_some_and(|d| window.contains(d)),
        }
    }

    fn covers_row(&self, date: Option<NaiveDate>) -> bool {
        match (self, date) {
            (ReplaceScope::All, _) => true,
            (ReplaceScope::Window(window), Some(d)) => window.contains(d),
            (ReplaceScope::Window(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitSummary {
    pub table: String,
    pub version: u64,
    pub rows_written: usize,
    pub partitions_written: usize,
    pub partitions_dropped: usize,
    pub rows_outside_scope: usize,
}

/// Bookkeeping for the most recent successful run against a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub mode: RunMode,
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub version: u64,
    pub rows_written: usize,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
    lock_ttl: TimeDelta,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, ttl: TimeDelta) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn lock_ttl(&self) -> TimeDelta {
        self.lock_ttl
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    /// Current manifest; an empty one if the table was never written.
    pub fn manifest(&self, table: &str) -> Result<TableManifest> {
        let path = self.table_dir(table).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(TableManifest {
                table: table.to_string(),
                ..Default::default()
            });
        }
        let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&body).with_context(|| format!("parsing {}", path.display()))
    }

    /// Absolute path of each committed partition file, keyed by label.
    pub fn partition_files(&self, table: &str) -> Result<BTreeMap<String, PathBuf>> {
        let dir = self.table_dir(table);
        Ok(self
            .manifest(table)?
            .partitions
            .into_iter()
            .map(|(label, entry)| (label, dir.join(entry.file)))
            .collect())
    }

    pub fn read_all<T: TableRow>(&self) -> Result<Vec<T>> {
        self.read_matching(|_| true)
    }

    /// Rows of every partition whose service date falls inside `window`.
    pub fn read_window<T: TableRow>(&self, window: &ServiceWindow) -> Result<Vec<T>> {
        self.read_matching(|label| parse_label(label).is_some_and(|d| window.contains(d)))
    }

    fn read_matching<T: TableRow>(&self, keep: impl Fn(&str) -> bool) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        for (label, path) in self.partition_files(T::TABLE)? {
            if !keep(&label) {
                continue;
            }
            let mut reader = csv::Reader::from_path(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            for record in reader.deserialize() {
                let row: T = record.with_context(|| format!("decoding {}", path.display()))?;
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Replaces every partition covered by `scope` with `rows`.
    ///
    /// Rows outside the scope are discarded. Partitions inside the scope that
    /// receive no rows are dropped. The result is visible to readers all at
    /// once, or not at all if this returns an error.
    pub fn replace<T: TableRow>(
        &self,
        scope: ReplaceScope,
        rows: Vec<T>,
        operation: &str,
    ) -> Result<CommitSummary> {
        let table_dir = self.table_dir(T::TABLE);
        fs::create_dir_all(&table_dir)
            .with_context(|| format!("creating {}", table_dir.display()))?;
        let _lock = TableLock::acquire(&table_dir.join(LOCK_FILE), operation, self.lock_ttl)?;

        let current = self.manifest(T::TABLE)?;
        let version = current.version + 1;

        let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
        let mut rows_outside_scope = 0;
        for row in rows {
            let date = row.partition_date();
            if scope.covers_row(date) {
                groups.entry(partition_label(date)).or_default().push(row);
            } else {
                rows_outside_scope += 1;
            }
        }
        if rows_outside_scope > 0 {
            debug!(table = T::TABLE, rows_outside_scope, "Discarding rows outside replace scope");
        }

        let mut staged: Vec<PathBuf> = Vec::new();
        let mut new_entries = BTreeMap::new();
        for (label, mut group) in groups {
            group.sort_by(|a, b| a.row_order(b));
            let file = format!("{label}/part-{version:08}.csv");
            let path = table_dir.join(&file);
            staged.push(path.clone());
            if let Err(e) = write_partition(&path, &group) {
                discard(&staged);
                return Err(e);
            }
            new_entries.insert(
                label,
                PartitionEntry {
                    file,
                    rows: group.len(),
                },
            );
        }

        let mut next = current.clone();
        next.table = T::TABLE.to_string();
        next.version = version;
        next.committed_at = Some(Utc::now());
        next.partitions.retain(|label, _| !scope.covers_label(label));
        let partitions_dropped = current
            .partitions
            .keys()
            .filter(|label| scope.covers_label(label) && !new_entries.contains_key(*label))
            .count();
        let rows_written = new_entries.values().map(|e: &PartitionEntry| e.rows).sum();
        let partitions_written = new_entries.len();
        next.partitions.extend(new_entries);

        if let Err(e) = write_atomic(&table_dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&next)?) {
            discard(&staged);
            return Err(e).context("committing manifest");
        }

        let swept = sweep_unreferenced(&table_dir, &next);

        info!(
            table = T::TABLE,
            version,
            rows_written,
            partitions_written,
            partitions_dropped,
            swept,
            "Table committed"
        );

        Ok(CommitSummary {
            table: T::TABLE.to_string(),
            version,
            rows_written,
            partitions_written,
            partitions_dropped,
            rows_outside_scope,
        })
    }

    pub fn record_run(&self, table: &str, record: &RunRecord) -> Result<()> {
        let path = self.table_dir(table).join(LAST_RUN_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(record)?)
    }

    pub fn last_run(&self, table: &str) -> Result<Option<RunRecord>> {
        let path = self.table_dir(table).join(LAST_RUN_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(
            serde_json::from_slice(&body).with_context(|| format!("parsing {}", path.display()))?,
        ))
    }
}

pub fn partition_label(date: Option<NaiveDate>) -> String {
    match date {
        Some(d) => format!("{PARTITION_PREFIX}{}", d.format("%Y-%m-%d")),
        None => UNPARTITIONED.to_string(),
    }
}

fn parse_label(label: &str) -> Option<NaiveDate> {
    label
        .strip_prefix(PARTITION_PREFIX)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

fn write_partition<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut body = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut body);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }
    write_atomic(path, &body)
}

/// Writes to a sibling temp file and renames it into place.
fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))
}

/// Removes partition and temp files under `table_dir` that `manifest` does
/// not reference, then any partition directory left empty. Returns the number
/// of files removed. Must run under the table lock.
fn sweep_unreferenced(table_dir: &Path, manifest: &TableManifest) -> usize {
    let referenced: BTreeSet<PathBuf> = manifest
        .partitions
        .values()
        .map(|entry| table_dir.join(&entry.file))
        .collect();
    let mut removed = 0;

    let remove = |path: &Path| match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed unreferenced file");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove unreferenced file");
            false
        }
    };

    let manifest_tmp = table_dir.join(format!("{MANIFEST_FILE}.tmp"));
    if manifest_tmp.exists() && remove(&manifest_tmp) {
        removed += 1;
    }

    let entries = match fs::read_dir(table_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %table_dir.display(), error = %e, "Failed to list table directory");
            return removed;
        }
    };
    for dir in entries.flatten().map(|entry| entry.path()) {
        let is_partition_dir = dir.is_dir()
            && dir.file_name().and_then(|n| n.to_str()).is_some_and(|label| {
                label == UNPARTITIONED || label.starts_with(PARTITION_PREFIX)
            });
        if !is_partition_dir {
            continue;
        }
        let Ok(files) = fs::read_dir(&dir) else {
            continue;
        };
        for path in files.flatten().map(|entry| entry.path()) {
            if referenced.contains(&path) || !is_table_file(&path) {
                continue;
            }
            if remove(&path) {
                removed += 1;
            }
        }
        // only succeeds when empty
        let _ = fs::remove_dir(&dir);
    }
    removed
}

/// `part-*.csv` data files and `*.tmp` staging files.
fn is_table_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".tmp") || (name.starts_with("part-") && name.ends_with(".csv"))
}

fn discard(staged: &[PathBuf]) {
    for path in staged {
        let _ = fs::remove_file(path);
    }
}
