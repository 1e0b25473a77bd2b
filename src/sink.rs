//! Daily-rotating CSV sink shared by the historical and streaming paths.
//!
//! One file per (dataset, ticker, UTC date):
//!
//! ```text
//! <base_dir>/running_trade/2025-11-03_BBRI.csv
//! <base_dir>/orderbook/2025-11-03_BBCA.csv
//! ```
//!
//! Files are append-only with a header on first write and a flush after
//! every logical append, so rows already written survive an unclean
//! shutdown. Appends for the same key are serialized; different keys write
//! in parallel. Rotation is lazy: the first append dated after midnight
//! opens the next-day file and the previous day's writer is flushed and
//! closed. All dating is UTC.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};

/// Logical dataset, one directory per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    RunningTrade,
    Orderbook,
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunningTrade => "running_trade",
            Self::Orderbook => "orderbook",
        }
    }

    /// Fixed column set, in output order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::RunningTrade => &[
                "id",
                "date",
                "time",
                "action",
                "code",
                "price",
                "change",
                "lot",
                "buyer",
                "seller",
                "trade_number",
                "buyer_type",
                "seller_type",
                "market_board",
            ],
            Self::Orderbook => &["timestamp", "price", "lots", "total_value", "side"],
        }
    }
}

/// Metadata for one on-disk CSV file.
#[derive(Debug, Clone, Serialize)]
pub struct CsvFileInfo {
    pub name: String,
    pub dataset: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileKey {
    dataset: Dataset,
    ticker: String,
    date: NaiveDate,
}

struct DailyWriter {
    writer: csv::Writer<File>,
    path: PathBuf,
}

/// Append-only CSV sink. Cheap to clone via `Arc` at the call sites.
pub struct CsvSink {
    base_dir: PathBuf,
    writers: Mutex<HashMap<FileKey, Arc<Mutex<DailyWriter>>>>,
}

impl CsvSink {
    /// Create the sink and its dataset directories. Failing to create the
    /// output tree is fatal for the whole process.
    pub fn new(base_dir: impl Into<PathBuf>) -> IngestResult<Self> {
        let base_dir = base_dir.into();
        for dataset in [Dataset::RunningTrade, Dataset::Orderbook] {
            fs::create_dir_all(base_dir.join(dataset.as_str()))
                .map_err(|e| IngestError::fatal(format!("cannot create data dir: {}", e)))?;
        }
        info!(base_dir = %base_dir.display(), "csv sink ready");
        Ok(Self {
            base_dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Deterministic path for a (dataset, ticker, date) tuple.
    pub fn file_path(&self, dataset: Dataset, ticker: &str, date: NaiveDate) -> PathBuf {
        self.base_dir
            .join(dataset.as_str())
            .join(format!("{}_{}.csv", date.format("%Y-%m-%d"), ticker))
    }

    /// Append rows to the daily file for the key, creating it (with header)
    /// on first use. Returns the number of rows written. The whole append is
    /// flushed before returning.
    pub fn append(
        &self,
        dataset: Dataset,
        ticker: &str,
        date: NaiveDate,
        rows: &[Vec<String>],
    ) -> IngestResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let handle = self.writer_for(dataset, ticker, date)?;
        let mut writer = handle.lock();

        for row in rows {
            writer
                .writer
                .write_record(row)
                .map_err(|e| IngestError::fatal(format!("csv write failed: {}", e)))?;
        }
        writer
            .writer
            .flush()
            .map_err(|e| IngestError::fatal(format!("csv flush failed: {}", e)))?;

        Ok(rows.len())
    }

    /// List files for a dataset, sorted by name (date-first naming makes
    /// that chronological).
    pub fn list_files(&self, dataset: Dataset) -> IngestResult<Vec<CsvFileInfo>> {
        let dir = self.base_dir.join(dataset.as_str());
        let mut files = Vec::new();

        for entry in fs::read_dir(&dir)
            .map_err(|e| IngestError::fatal(format!("cannot read {}: {}", dir.display(), e)))?
        {
            let entry = entry.map_err(|e| IngestError::fatal(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".csv") {
                continue;
            }
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(CsvFileInfo {
                name,
                dataset: dataset.as_str().to_string(),
                size_bytes,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Open a previously written file for reading. The path is relative to
    /// the sink root and must not escape it.
    pub fn open_for_read(&self, relative: &str) -> IngestResult<File> {
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(IngestError::malformed(format!(
                "path escapes data dir: {:?}",
                relative
            )));
        }

        let path = self.base_dir.join(rel);
        File::open(&path)
            .map_err(|e| IngestError::fatal(format!("cannot open {}: {}", path.display(), e)))
    }

    /// Get or create the writer for a key. Creating a writer for a new date
    /// retires same-ticker writers from earlier dates (lazy rotation).
    fn writer_for(
        &self,
        dataset: Dataset,
        ticker: &str,
        date: NaiveDate,
    ) -> IngestResult<Arc<Mutex<DailyWriter>>> {
        let key = FileKey {
            dataset,
            ticker: ticker.to_string(),
            date,
        };

        let mut map = self.writers.lock();
        if let Some(existing) = map.get(&key) {
            return Ok(existing.clone());
        }

        let path = self.file_path(dataset, ticker, date);
        let needs_header = !path.exists() || path.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| IngestError::fatal(format!("cannot open {}: {}", path.display(), e)))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer
                .write_record(dataset.columns())
                .map_err(|e| IngestError::fatal(format!("csv header write failed: {}", e)))?;
            writer
                .flush()
                .map_err(|e| IngestError::fatal(format!("csv flush failed: {}", e)))?;
        }

        debug!(path = %path.display(), "opened daily csv");

        // Lazy rotation: retire earlier-dated writers for the same ticker.
        let stale: Vec<FileKey> = map
            .keys()
            .filter(|k| k.dataset == dataset && k.ticker == key.ticker && k.date < date)
            .cloned()
            .collect();
        for old_key in stale {
            if let Some(old) = map.remove(&old_key) {
                let mut old = old.lock();
                let _ = old.writer.flush();
                debug!(path = %old.path.display(), "closed rotated csv");
            }
        }

        let handle = Arc::new(Mutex::new(DailyWriter { writer, path }));
        map.insert(key, handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    fn ob_row(ts: &str, price: &str) -> Vec<String> {
        vec![
            ts.to_string(),
            price.to_string(),
            "10".to_string(),
            "95500".to_string(),
            "BID".to_string(),
        ]
    }

    #[test]
    fn test_header_then_rows_in_order() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let d = date("2025-11-03");

        sink.append(
            Dataset::Orderbook,
            "BBCA",
            d,
            &[ob_row("t1", "9550"), ob_row("t2", "9525")],
        )
        .unwrap();
        sink.append(Dataset::Orderbook, "BBCA", d, &[ob_row("t3", "9500")])
            .unwrap();

        let lines = read_lines(&sink.file_path(Dataset::Orderbook, "BBCA", d));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,price,lots,total_value,side");
        assert!(lines[1].starts_with("t1,9550"));
        assert!(lines[3].starts_with("t3,9500"));
    }

    #[test]
    fn test_midnight_rotation() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let before = date("2025-11-03");
        let after = date("2025-11-04");

        sink.append(Dataset::Orderbook, "BBCA", before, &[ob_row("23:59:59", "1")])
            .unwrap();
        sink.append(Dataset::Orderbook, "BBCA", after, &[ob_row("00:00:01", "2")])
            .unwrap();

        let first = read_lines(&sink.file_path(Dataset::Orderbook, "BBCA", before));
        let second = read_lines(&sink.file_path(Dataset::Orderbook, "BBCA", after));

        // Each day's file carries a header and exactly its own rows.
        assert_eq!(first.len(), 2);
        assert!(first[1].starts_with("23:59:59"));
        assert_eq!(second.len(), 2);
        assert!(second[1].starts_with("00:00:01"));

        // The rotated writer is gone from the handle map.
        assert_eq!(sink.writers.lock().len(), 1);
    }

    #[test]
    fn test_concurrent_same_key_appends() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(CsvSink::new(dir.path()).unwrap());
        let d = date("2025-11-03");

        let mut handles = Vec::new();
        for t in 0..8 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    sink.append(
                        Dataset::Orderbook,
                        "BBCA",
                        d,
                        &[ob_row(&format!("{}:{}", t, i), "9550")],
                    )
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let lines = read_lines(&sink.file_path(Dataset::Orderbook, "BBCA", d));
        // Header + one intact line per append, nothing interleaved.
        assert_eq!(lines.len(), 1 + 8 * 25);
        assert!(lines.iter().skip(1).all(|l| l.ends_with(",BID")));
    }

    #[test]
    fn test_reopen_existing_file_skips_header() {
        let dir = tempdir().unwrap();
        let d = date("2025-11-03");

        {
            let sink = CsvSink::new(dir.path()).unwrap();
            sink.append(Dataset::Orderbook, "BBCA", d, &[ob_row("t1", "1")])
                .unwrap();
        }
        {
            let sink = CsvSink::new(dir.path()).unwrap();
            sink.append(Dataset::Orderbook, "BBCA", d, &[ob_row("t2", "2")])
                .unwrap();
            let lines = read_lines(&sink.file_path(Dataset::Orderbook, "BBCA", d));
            assert_eq!(lines.len(), 3);
            assert_eq!(lines[0], "timestamp,price,lots,total_value,side");
        }
    }

    #[test]
    fn test_list_and_read_confinement() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let d = date("2025-11-03");

        sink.append(Dataset::RunningTrade, "BBRI", d, &[vec!["x".to_string(); 14]])
            .unwrap();

        let files = sink.list_files(Dataset::RunningTrade).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "2025-11-03_BBRI.csv");
        assert!(files[0].size_bytes > 0);

        assert!(sink
            .open_for_read("running_trade/2025-11-03_BBRI.csv")
            .is_ok());
        assert!(sink.open_for_read("../outside.csv").is_err());
        assert!(sink.open_for_read("/etc/passwd").is_err());
    }
}
