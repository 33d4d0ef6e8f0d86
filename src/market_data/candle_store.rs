// =============================================================================
// Candle Store — bounded, persisted history of finalized candles
// =============================================================================
//
// The history lives behind a single `parking_lot::RwLock`. Appends (push +
// eviction) happen under the write lock; readers copy what they need under
// the read lock, so no caller ever holds a reference into the live ring.
//
// Every append rewrites the snapshot file wholesale using tmp + rename. A
// separate persist mutex keeps snapshot writes in append order without
// holding the history lock across file I/O. The file I/O is blocking; async
// callers go through `spawn_blocking` (see `aggregator::run_aggregator`).
//
// =============================================================================

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::types::Candle;

/// Result of handing a candle to [`CandleStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The candle completed the partial tail left by a previous shutdown.
    ReplacedPartial,
    /// The candle's bucket is not after the newest stored bucket.
    Rejected,
}

struct History {
    candles: VecDeque<Candle>,
    /// The newest candle was flushed at shutdown before its bucket closed.
    partial_tail: bool,
}

/// On-disk layouts accepted at startup. A plain array is written whenever
/// the tail is final; the object form only carries the partial-tail marker.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Bare(Vec<Candle>),
    Tagged {
        #[serde(default)]
        partial_tail: bool,
        candles: Vec<Candle>,
    },
}

pub struct CandleStore {
    history: RwLock<History>,
    persist_lock: Mutex<()>,
    snapshot_path: PathBuf,
    cap: usize,
    persist_failures: AtomicU64,
}

impl CandleStore {
    /// Open the store backed by `snapshot_path`, loading any existing
    /// snapshot.
    ///
    /// Never fails: a missing file is created empty, and an unreadable or
    /// corrupt one is moved aside and replaced by an empty history.
    pub fn open(snapshot_path: impl Into<PathBuf>, cap: usize) -> Self {
        let snapshot_path = snapshot_path.into();
        let cap = cap.max(1);

        if let Some(dir) = snapshot_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "failed to create snapshot directory");
            }
        }

        let (candles, partial_tail, needs_write) = match load_snapshot(&snapshot_path) {
            Ok(Some((candles, partial))) => {
                let candles = sanitize(candles, cap);
                let partial = partial && !candles.is_empty();
                info!(
                    path = %snapshot_path.display(),
                    candles = candles.len(),
                    partial_tail = partial,
                    "candle snapshot loaded"
                );
                (candles, partial, false)
            }
            Ok(None) => {
                info!(path = %snapshot_path.display(), "no candle snapshot found, starting empty");
                (VecDeque::new(), false, true)
            }
            Err(e) => {
                warn!(
                    path = %snapshot_path.display(),
                    error = %format!("{e:#}"),
                    "candle snapshot unreadable, resetting to empty history"
                );
                quarantine(&snapshot_path);
                (VecDeque::new(), false, true)
            }
        };

        let store = Self {
            history: RwLock::new(History {
                candles,
                partial_tail,
            }),
            persist_lock: Mutex::new(()),
            snapshot_path,
            cap,
            persist_failures: AtomicU64::new(0),
        };

        if needs_write {
            store.persist_now();
        }
        store
    }

    /// Append a finalized candle, evict down to the cap and persist.
    pub fn append(&self, candle: Candle) -> AppendOutcome {
        self.push(candle, false)
    }

    /// Append the in-progress candle at shutdown, marking it partial so the
    /// next run can resume it.
    pub fn append_partial(&self, candle: Candle) -> AppendOutcome {
        self.push(candle, true)
    }

    fn push(&self, candle: Candle, partial: bool) -> AppendOutcome {
        let _persist = self.persist_lock.lock();

        let (outcome, rows, partial_tail) = {
            let mut h = self.history.write();

            let outcome = match h.candles.back().map(|c| c.bucket_start) {
                Some(last) if last == candle.bucket_start && h.partial_tail => {
                    h.candles.pop_back();
                    AppendOutcome::ReplacedPartial
                }
                Some(last) if candle.bucket_start <= last => AppendOutcome::Rejected,
                _ => AppendOutcome::Appended,
            };

            if outcome == AppendOutcome::Rejected {
                warn!(
                    candle = %candle,
                    newest = ?h.candles.back().map(|c| c.bucket_start),
                    "rejecting candle that does not advance the history"
                );
                return outcome;
            }

            h.candles.push_back(candle);
            h.partial_tail = partial;
            while h.candles.len() > self.cap {
                h.candles.pop_front();
            }

            let rows: Vec<Candle> = h.candles.iter().copied().collect();
            (outcome, rows, h.partial_tail)
        };

        debug!(candle = %candle, outcome = ?outcome, held = rows.len(), "candle stored");
        self.write_or_count(&rows, partial_tail);
        outcome
    }

    /// Write the current history to disk regardless of pending appends.
    pub fn persist_now(&self) {
        let _persist = self.persist_lock.lock();
        let (rows, partial_tail) = {
            let h = self.history.read();
            (h.candles.iter().copied().collect::<Vec<_>>(), h.partial_tail)
        };
        self.write_or_count(&rows, partial_tail);
    }

    fn write_or_count(&self, rows: &[Candle], partial_tail: bool) {
        if let Err(e) = write_snapshot(&self.snapshot_path, rows, partial_tail) {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                path = %self.snapshot_path.display(),
                error = %format!("{e:#}"),
                "failed to persist candle snapshot, keeping in-memory history"
            );
        }
    }

    /// The most recent `min(k, len)` candles, oldest first.
    pub fn recent(&self, k: usize) -> Vec<Candle> {
        let h = self.history.read();
        let start = h.candles.len().saturating_sub(k);
        h.candles.iter().skip(start).copied().collect()
    }

    /// The newest candle if it was flushed before its bucket closed.
    pub fn partial_tail(&self) -> Option<Candle> {
        let h = self.history.read();
        if h.partial_tail {
            h.candles.back().copied()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.history.read().candles.len()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Snapshot file I/O
// ---------------------------------------------------------------------------

/// `Ok(None)` when the file does not exist.
fn load_snapshot(path: &Path) -> Result<Option<(Vec<Candle>, bool)>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let parsed: SnapshotFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    Ok(Some(match parsed {
        SnapshotFile::Tagged {
            partial_tail,
            candles,
        } => (candles, partial_tail),
        SnapshotFile::Bare(candles) => (candles, false),
    }))
}

/// Drop rows that break ordering or OHLC consistency, keep the newest `cap`.
fn sanitize(candles: Vec<Candle>, cap: usize) -> VecDeque<Candle> {
    let total = candles.len();
    let mut out: VecDeque<Candle> = VecDeque::with_capacity(total.min(cap));
    for c in candles {
        let advances = out.back().map_or(true, |last| c.bucket_start > last.bucket_start);
        if advances && c.is_consistent() {
            out.push_back(c);
        }
    }
    if out.len() < total {
        warn!(dropped = total - out.len(), "discarded out-of-order or inconsistent candles from snapshot");
    }
    while out.len() > cap {
        out.pop_front();
    }
    out
}

/// One tuple per line, so the file stays readable and diffable.
fn render_snapshot(rows: &[Candle], partial_tail: bool) -> Result<String> {
    let mut lines = Vec::with_capacity(rows.len());
    for c in rows {
        lines.push(serde_json::to_string(c).context("failed to serialise candle")?);
    }
    let body = format!("[\n{}\n]", lines.join(",\n"));
    if partial_tail {
        Ok(format!("{{\"partial_tail\": true, \"candles\": {body}}}\n"))
    } else {
        Ok(body)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "candles".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomic write: write to a temporary sibling file, then rename.
fn write_snapshot(path: &Path, rows: &[Candle], partial_tail: bool) -> Result<()> {
    let content = render_snapshot(rows, partial_tail)?;
    let tmp = tmp_path(path);

    std::fs::write(&tmp, &content)
        .with_context(|| format!("failed to write tmp snapshot to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;
    Ok(())
}

/// Move an unreadable snapshot out of the way so it can be inspected.
fn quarantine(path: &Path) {
    if !path.exists() {
        return;
    }
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "candles".into());
    name.push(".corrupt");
    let target = path.with_file_name(name);
    match std::fs::rename(path, &target) {
        Ok(()) => warn!(moved_to = %target.display(), "corrupt snapshot moved aside"),
        Err(e) => warn!(error = %e, "failed to move corrupt snapshot aside"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn candle(bucket_start: i64, base: f64) -> Candle {
        Candle {
            bucket_start,
            open: base,
            high: base + 2.0,
            low: base - 1.0,
            close: base + 1.0,
        }
    }

    #[test]
    fn missing_snapshot_starts_empty_and_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("candles.json");

        let store = CandleStore::open(&path, 10);
        assert_eq!(store.len(), 0);
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, "[\n\n]");
        let parsed: Vec<Candle> = serde_json::from_str(&on_disk).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn eviction_keeps_last_n_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CandleStore::open(dir.path().join("c.json"), 10);

        for i in 0..15 {
            assert_eq!(store.append(candle(i * 5, 100.0 + i as f64)), AppendOutcome::Appended);
        }

        assert_eq!(store.len(), 10);
        let all = store.recent(100);
        let starts: Vec<i64> = all.iter().map(|c| c.bucket_start).collect();
        assert_eq!(starts, (5..15).map(|i| i * 5).collect::<Vec<_>>());
    }

    #[test]
    fn recent_returns_tail_chronologically() {
        let dir = tempfile::tempdir().unwrap();
        let store = CandleStore::open(dir.path().join("c.json"), 10);
        for i in 0..4 {
            store.append(candle(i * 5, 10.0));
        }

        let last_two = store.recent(2);
        assert_eq!(last_two.iter().map(|c| c.bucket_start).collect::<Vec<_>>(), vec![10, 15]);
        assert_eq!(store.recent(50).len(), 4);
        assert!(store.recent(0).is_empty());
    }

    #[test]
    fn restart_reloads_identical_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let written: Vec<Candle> = (0..7).map(|i| candle(100 + i * 5, 1.5 * i as f64 + 3.25)).collect();

        {
            let store = CandleStore::open(&path, 5);
            for c in &written {
                store.append(*c);
            }
        }

        let reopened = CandleStore::open(&path, 5);
        assert_eq!(reopened.recent(100), written[2..].to_vec());
        assert_eq!(reopened.partial_tail(), None);
    }

    #[test]
    fn corrupt_snapshot_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "[\n[100, 1, 2, 0.5, 1.5],\n[105, 1, 2").unwrap();

        let store = CandleStore::open(&path, 10);
        assert_eq!(store.len(), 0);
        assert!(dir.path().join("c.json.corrupt").exists());

        store.append(candle(200, 5.0));
        let reopened = CandleStore::open(&path, 10);
        assert_eq!(reopened.recent(10), vec![candle(200, 5.0)]);
    }

    #[test]
    fn legacy_bare_array_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "[\n[100,10,12,8,8],\n[105,20,20,20,20]\n]").unwrap();

        let store = CandleStore::open(&path, 10);
        let got = store.recent(10);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], Candle { bucket_start: 100, open: 10.0, high: 12.0, low: 8.0, close: 8.0 });
    }

    #[test]
    fn out_of_order_rows_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "[[100,1,1,1,1],[95,1,1,1,1],[105,1,0,2,1],[110,1,1,1,1]]").unwrap();

        let store = CandleStore::open(&path, 10);
        let starts: Vec<i64> = store.recent(10).iter().map(|c| c.bucket_start).collect();
        assert_eq!(starts, vec![100, 110]);
    }

    #[test]
    fn huge_cap_over_existing_snapshot_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "[[100,1,1,1,1]]").unwrap();

        let store = CandleStore::open(&path, 1usize << 40);
        assert_eq!(store.recent(10), vec![Candle::opening(100, 1.0)]);

        let store = CandleStore::open(&path, usize::MAX);
        assert_eq!(store.len(), 1);
        assert_eq!(store.append(Candle::opening(105, 2.0)), AppendOutcome::Appended);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn non_advancing_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CandleStore::open(dir.path().join("c.json"), 10);
        store.append(candle(100, 1.0));

        assert_eq!(store.append(candle(100, 2.0)), AppendOutcome::Rejected);
        assert_eq!(store.append(candle(95, 2.0)), AppendOutcome::Rejected);
        assert_eq!(store.recent(10), vec![candle(100, 1.0)]);
    }

    #[test]
    fn partial_tail_survives_restart_and_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");

        {
            let store = CandleStore::open(&path, 10);
            store.append(candle(100, 1.0));
            store.append_partial(candle(105, 2.0));
        }

        let store = CandleStore::open(&path, 10);
        assert_eq!(store.partial_tail(), Some(candle(105, 2.0)));

        let completed = Candle { close: 9.0, high: 9.0, ..candle(105, 2.0) };
        assert_eq!(store.append(completed), AppendOutcome::ReplacedPartial);
        assert_eq!(store.partial_tail(), None);
        assert_eq!(store.recent(10), vec![candle(100, 1.0), completed]);

        let reopened = CandleStore::open(&path, 10);
        assert_eq!(reopened.partial_tail(), None);
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn persist_failure_keeps_memory_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("c.json");

        let store = CandleStore::open(&path, 10);
        let failures_after_open = store.persist_failures();
        assert_eq!(store.append(candle(100, 1.0)), AppendOutcome::Appended);

        assert_eq!(store.recent(10), vec![candle(100, 1.0)]);
        assert_eq!(store.persist_failures(), failures_after_open + 1);
    }

    #[test]
    fn concurrent_reads_never_observe_torn_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CandleStore::open(dir.path().join("c.json"), 50));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..300i64 {
                    let p = i as f64;
                    store.append(Candle { bucket_start: i * 5, open: p, high: p + 1.0, low: p - 1.0, close: p });
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..300 {
                        let snap = store.recent(50);
                        assert!(snap.len() <= 50);
                        for w in snap.windows(2) {
                            assert!(w[0].bucket_start < w[1].bucket_start);
                        }
                        for c in &snap {
                            let p = (c.bucket_start / 5) as f64;
                            assert_eq!((c.open, c.high, c.low, c.close), (p, p + 1.0, p - 1.0, p));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.len(), 50);
    }
}
