//! Durable storage primitives: tmp+rename atomic writes, the append-mode
//! metrics log, and the dedupe pass that makes the log the single source
//! of truth for resume decisions.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::metrics::{Integrity, MetricsRow};

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Retry a filesystem operation with bounded exponential backoff.
/// Transient failures (disk pressure, momentary permission errors) get a
/// few chances before the error propagates.
pub fn with_retry<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(err) if attempt >= RETRY_ATTEMPTS => {
                return Err(err.context(format!("{} failed after {} attempts", what, attempt)))
            }
            Err(err) => {
                warn!(
                    "Attempt {}/{} for {} failed: {:#}. Retrying in {:?}.",
                    attempt, RETRY_ATTEMPTS, what, err, delay
                );
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Write a file atomically: write `<path>.tmp`, rename over `<path>`.
/// Readers observe either the old or the new content, never a partial
/// file. The tmp file is removed on failure.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    let write = || -> Result<()> {
        let mut f = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file: {:?}", tmp))?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename {:?} -> {:?}", tmp, path))?;
        Ok(())
    };
    let result = with_retry(&format!("atomic write {:?}", path), write);
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &json)
}

pub fn atomic_write_str(path: &Path, s: &str) -> Result<()> {
    atomic_write_bytes(path, s.as_bytes())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Append-only per-cell metrics log. Appends are not atomic; a crash can
/// leave a partial trailing line, which `recover` discards.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
}

/// What a recovery pass learned about the log.
#[derive(Debug)]
pub struct LogRecovery {
    /// Deduped rows, sorted ascending by perm_index.
    pub rows: Vec<MetricsRow>,
    pub integrity: Integrity,
    /// The next permutation index to produce.
    pub start_idx: u32,
    /// Whether the on-disk file was rewritten to the canonical form.
    pub rewritten: bool,
}

impl MetricsLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create an empty log with a header. No-op if the file exists.
    pub fn create(&self) -> Result<()> {
        if self.exists() {
            return Ok(());
        }
        with_retry(&format!("create metrics log {:?}", self.path), || {
            let mut f = File::create(&self.path)
                .with_context(|| format!("Failed to create metrics log: {:?}", self.path))?;
            writeln!(f, "{}", MetricsRow::CSV_HEADER)?;
            f.sync_all()?;
            Ok(())
        })
    }

    /// Append one chunk of rows and flush.
    pub fn append_chunk(&self, rows: &[MetricsRow]) -> Result<()> {
        with_retry(&format!("append to metrics log {:?}", self.path), || {
            let mut f = OpenOptions::new()
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open metrics log: {:?}", self.path))?;
            let mut buf = String::with_capacity(rows.len() * 64);
            for row in rows {
                buf.push_str(&row.to_csv_line());
                buf.push('\n');
            }
            f.write_all(buf.as_bytes())?;
            f.sync_all()?;
            Ok(())
        })
    }

    /// Quick row count for status display; parses but does not dedupe.
    pub fn count_rows(&self) -> Result<u64> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open metrics log: {:?}", self.path))?;
        let mut count = 0u64;
        for line in BufReader::new(file).lines() {
            if MetricsRow::parse_csv_line(&line?).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// The dedupe algorithm, run on every resume and at finalize.
    ///
    /// Stream-parses the log, keeping the first-seen row per perm_index
    /// and discarding a malformed tail (crash-during-append). The file is
    /// rewritten atomically in canonical form (sorted, header, one row
    /// per index) whenever anything was dropped, and truncated to the
    /// first `n_target` indices when it somehow holds more.
    ///
    /// The resume position is `max(perm_index) + 1`: gaps below the max
    /// are never refilled, production only ever advances.
    pub fn recover(&self, n_target: u32) -> Result<LogRecovery> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open metrics log: {:?}", self.path))?;
        let reader = BufReader::new(file);

        let mut by_index: std::collections::BTreeMap<u32, MetricsRow> =
            std::collections::BTreeMap::new();
        let mut n_rows_raw = 0u64;
        let mut n_duplicates = 0u64;
        let mut dropped_line = false;
        let mut line_no = 0usize;

        for line in reader.lines() {
            let line = line
                .with_context(|| format!("Failed to read metrics log: {:?}", self.path))?;
            line_no += 1;
            match MetricsRow::parse_csv_line(&line) {
                Some(row) => {
                    n_rows_raw += 1;
                    if by_index.contains_key(&row.perm_index) {
                        n_duplicates += 1;
                    } else {
                        by_index.insert(row.perm_index, row);
                    }
                }
                None => {
                    // Line 1 is the header; anything else unparseable is
                    // a partial or corrupt row to discard on rewrite.
                    if line_no > 1 {
                        dropped_line = true;
                    }
                }
            }
        }

        // Over-target logs are truncated to the first n_target indices.
        let mut truncated = false;
        while by_index.len() as u32 > n_target {
            let last = *by_index.keys().next_back().expect("non-empty map");
            by_index.remove(&last);
            truncated = true;
        }

        let rows: Vec<MetricsRow> = by_index.into_values().collect();
        let integrity = Integrity {
            n_rows_raw,
            n_duplicates_dropped: n_duplicates,
            n_rows_deduped: rows.len() as u64,
        };
        let start_idx = rows.last().map(|r| r.perm_index + 1).unwrap_or(0);

        let needs_rewrite = n_duplicates > 0 || dropped_line || truncated;
        if needs_rewrite {
            let mut buf = String::with_capacity(rows.len() * 64 + 64);
            buf.push_str(MetricsRow::CSV_HEADER);
            buf.push('\n');
            for row in &rows {
                buf.push_str(&row.to_csv_line());
                buf.push('\n');
            }
            atomic_write_bytes(&self.path, buf.as_bytes())?;
        }

        Ok(LogRecovery {
            rows,
            integrity,
            start_idx,
            rewritten: needs_rewrite,
        })
    }
}

/// Append a line to a plain text log (per-cell `logs.txt`). Best-effort;
/// an unwritable event log never fails the cell.
pub fn append_log_line(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(err) = result {
        warn!("Failed to append to {:?}: {}", path, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRow;

    fn row(perm_index: u32) -> MetricsRow {
        MetricsRow {
            perm_index,
            total_return_pct: 0.05 + perm_index as f64 * 1e-4,
            max_drawdown_pct: 0.01,
            profit_factor: 1.4,
            worst_month_pct: -0.02,
            trades_executed: 90,
        }
    }

    fn log_in(dir: &Path) -> MetricsLog {
        MetricsLog::new(dir.join("metrics_compact.csv"))
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        atomic_write_bytes(&path, b"{\"a\":1}").unwrap();
        atomic_write_bytes(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        assert!(!dir.path().join("progress.json.tmp").exists());
    }

    #[test]
    fn clean_log_recovers_without_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.create().unwrap();
        log.append_chunk(&(0..10).map(row).collect::<Vec<_>>()).unwrap();

        let rec = log.recover(100).unwrap();
        assert!(!rec.rewritten);
        assert_eq!(rec.rows.len(), 10);
        assert_eq!(rec.start_idx, 10);
        assert_eq!(rec.integrity.n_duplicates_dropped, 0);
    }

    #[test]
    fn duplicates_and_partial_tail_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.create().unwrap();
        log.append_chunk(&(0..200).map(row).collect::<Vec<_>>()).unwrap();
        // 50 duplicated rows plus a partial trailing line, as left by a
        // crash mid-append.
        log.append_chunk(&(25..75).map(row).collect::<Vec<_>>()).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
            write!(f, "137,0.05").unwrap();
        }

        let rec = log.recover(200).unwrap();
        assert!(rec.rewritten);
        assert_eq!(rec.integrity.n_rows_raw, 250);
        assert_eq!(rec.integrity.n_duplicates_dropped, 50);
        assert_eq!(rec.integrity.n_rows_deduped, 200);
        assert_eq!(rec.start_idx, 200);

        // The rewrite is canonical: header plus one sorted row per index.
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], MetricsRow::CSV_HEADER);
        assert_eq!(lines.len(), 201);
        let indices: Vec<u32> = lines[1..]
            .iter()
            .map(|l| MetricsRow::parse_csv_line(l).unwrap().perm_index)
            .collect();
        assert_eq!(indices, (0..200).collect::<Vec<_>>());

        // Idempotent: a second recovery touches nothing.
        let rec2 = log.recover(200).unwrap();
        assert!(!rec2.rewritten);
        assert_eq!(rec2.integrity.n_duplicates_dropped, 0);
    }

    #[test]
    fn first_seen_row_wins_for_duplicate_indices() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.create().unwrap();
        let first = row(3);
        let mut second = row(3);
        second.total_return_pct = 99.0;
        log.append_chunk(&[first, second]).unwrap();

        let rec = log.recover(10).unwrap();
        assert_eq!(rec.rows.len(), 1);
        assert_eq!(rec.rows[0].total_return_pct, first.total_return_pct);
    }

    #[test]
    fn gaps_resume_past_the_max() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.create().unwrap();
        let rows: Vec<MetricsRow> = [0u32, 1, 2, 5, 6].iter().map(|&i| row(i)).collect();
        log.append_chunk(&rows).unwrap();

        let rec = log.recover(100).unwrap();
        // Indices 3 and 4 are never refilled; production continues at 7.
        assert_eq!(rec.start_idx, 7);
        assert_eq!(rec.integrity.n_rows_deduped, 5);
    }

    #[test]
    fn over_target_log_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.create().unwrap();
        log.append_chunk(&(0..30).map(row).collect::<Vec<_>>()).unwrap();

        let rec = log.recover(20).unwrap();
        assert!(rec.rewritten);
        assert_eq!(rec.rows.len(), 20);
        assert_eq!(rec.rows.last().unwrap().perm_index, 19);
    }

    #[test]
    fn empty_log_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        log.create().unwrap();
        let rec = log.recover(10).unwrap();
        assert_eq!(rec.start_idx, 0);
        assert!(rec.rows.is_empty());
    }
}
