//! Snapshot persistence and report printing.
//!
//! Captured rows are appended to one CSV per stream per UTC capture date:
//! `{dir}/{stream}/date=YYYY-MM-DD.csv`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::WriterBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Logs a value as pretty-printed JSON.
pub fn print_json(value: &impl Serialize) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn dated_path(dir: &Path, stream: &str, date: NaiveDate) -> PathBuf {
    dir.join(stream).join(format!("date={}.csv", date.format("%Y-%m-%d")))
}

/// Capture date encoded in a `date=YYYY-MM-DD.csv` file name.
pub fn parse_dated_file(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let date = name.strip_prefix("date=")?.strip_suffix(".csv")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Appends records as rows to a CSV file.
///
/// Creates the file (and parent directories) with headers if it does not
/// already exist or is empty.
pub fn append_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let has_content = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    debug!(path = %path.display(), has_content, rows = records.len(), "Appending CSV records");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut writer = WriterBuilder::new()
        .has_headers(!has_content) // IMPORTANT when appending
        .from_writer(file);

    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}

pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("decoding {}", path.display()))
}

/// Reads every dated file of `stream` whose capture date passes `keep`.
pub fn read_dated_records<T: DeserializeOwned>(
    dir: &Path,
    stream: &str,
    keep: impl Fn(NaiveDate) -> bool,
) -> Result<Vec<T>> {
    let stream_dir = dir.join(stream);
    if !stream_dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(&stream_dir)
        .with_context(|| format!("listing {}", stream_dir.display()))?
    {
        let path = entry?.path();
        if parse_dated_file(&path).is_some_and(&keep) {
            files.push(path);
        }
    }
    files.sort();

    let mut rows = Vec::new();
    for path in files {
        rows.extend(read_records::<T>(&path)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::env;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        timestamp: String,
        value: Option<i64>,
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("transit_reliability_output_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn row(value: Option<i64>) -> Row {
        Row {
            timestamp: "2024-03-01T15:00:00Z".to_string(),
            value,
        }
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&row(Some(1))).unwrap();
    }

    #[test]
    fn test_append_records_creates_file() {
        let path = temp_dir("create").join("nested").join("rows.csv");

        append_records(&path, &[row(Some(1))]).unwrap();

        assert!(path.exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.is_empty());
    }

    #[test]
    fn test_append_records_writes_header_once() {
        let path = temp_dir("header").join("rows.csv");

        append_records(&path, &[row(Some(1))]).unwrap();
        append_records(&path, &[row(None), row(Some(3))]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // Header line should appear exactly once
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 4);

        let rows: Vec<Row> = read_records(&path).unwrap();
        assert_eq!(rows, vec![row(Some(1)), row(None), row(Some(3))]);
    }

    #[test]
    fn test_read_dated_records_filters_by_date() {
        let dir = temp_dir("dated");
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        append_records(&dated_path(&dir, "stream", d1), &[row(Some(1))]).unwrap();
        append_records(&dated_path(&dir, "stream", d2), &[row(Some(2))]).unwrap();
        fs::write(dir.join("stream").join("notes.txt"), "ignored").unwrap();

        let rows: Vec<Row> = read_dated_records(&dir, "stream", |d| d == d2).unwrap();
        assert_eq!(rows, vec![row(Some(2))]);

        let all: Vec<Row> = read_dated_records(&dir, "stream", |_| true).unwrap();
        assert_eq!(all.len(), 2);

        let none: Vec<Row> = read_dated_records(&dir, "missing", |_| true).unwrap();
        assert!(none.is_empty());
    }
}
