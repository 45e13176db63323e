//! Recording store: the process-wide set of executed classes
//!
//! `record` only touches an in-memory set. Durability belongs to a sidecar
//! thread that periodically writes the whole set to a plain text file, one
//! class name per line, and only when the set grew since the last write.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ APPLICATION THREADS                                         │
//! │   huella$notify() → record("app.Foo") → set.insert()        │
//! └─────────────────────────────────────────────────────────────┘
//!                          │ parking_lot::Mutex<IndexSet>
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │ FLUSH THREAD                                                │
//! │   every interval, and once on shutdown:                     │
//! │     snapshot under lock → write + rename outside lock       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use indexmap::IndexSet;
use parking_lot::Mutex;
use thiserror::Error;

/// A flush that could not reach durable storage
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("failed to write coverage snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of a `flush_if_changed` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written { entries: usize },
    /// Nothing was recorded since the last write
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderStats {
    /// Calls to `record`, duplicates included
    pub record_calls: u64,
    /// Distinct class names in the set
    pub distinct: usize,
    /// Snapshot files written
    pub flushes: u64,
}

/// Insertion-ordered, append-only set of executed class names
#[derive(Debug)]
pub struct RecordingStore {
    path: PathBuf,
    entries: Mutex<IndexSet<String>>,
    /// Serializes flushes; holds the entry count of the last successful write
    last_written: Mutex<usize>,
    record_calls: AtomicU64,
    flushes: AtomicU64,
}

impl RecordingStore {
    /// Create a store that flushes to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(IndexSet::new()),
            last_written: Mutex::new(0),
            record_calls: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add `unit_id`; returns true if it was not yet present
    pub fn record(&self, unit_id: &str) -> bool {
        self.record_calls.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        if entries.contains(unit_id) {
            return false;
        }
        entries.insert(unit_id.to_owned());
        drop(entries);
        tracing::trace!(unit = unit_id, "recorded");
        true
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.entries.lock().contains(unit_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the set in insertion order
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            record_calls: self.record_calls.load(Ordering::Relaxed),
            distinct: self.len(),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    /// Write the set to disk if it grew since the last successful write.
    ///
    /// The set lock is held only while copying; the file is written outside
    /// it, so recording never waits on I/O. A failure is logged and returned;
    /// it is not retried here.
    pub fn flush_if_changed(&self) -> Result<FlushOutcome, FlushError> {
        let mut last_written = self.last_written.lock();
        let snapshot = {
            let entries = self.entries.lock();
            if entries.len() == *last_written {
                return Ok(FlushOutcome::Unchanged);
            }
            entries.iter().cloned().collect::<Vec<_>>()
        };

        if let Err(source) = write_snapshot(&self.path, &snapshot) {
            let err = FlushError::Write {
                path: self.path.clone(),
                source,
            };
            tracing::error!(error = %err, "coverage flush failed");
            return Err(err);
        }

        *last_written = snapshot.len();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entries = snapshot.len(), path = %self.path.display(), "coverage flushed");
        Ok(FlushOutcome::Written {
            entries: snapshot.len(),
        })
    }
}

/// Overwrite `path` with one entry per line, via a sibling temporary file
fn write_snapshot(path: &Path, entries: &[String]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut out = BufWriter::new(File::create(&tmp)?);
    for entry in entries {
        out.write_all(entry.as_bytes())?;
        out.write_all(b"\n")?;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    std::fs::rename(&tmp, path)
}

/// Sidecar thread flushing a store on a fixed interval
///
/// `shutdown` (or dropping the worker) stops the thread and performs the
/// final flush.
pub struct FlushWorker {
    store: Arc<RecordingStore>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    pub fn spawn(store: Arc<RecordingStore>, interval: Duration) -> io::Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let worker_store = Arc::clone(&store);
        let handle = thread::Builder::new()
            .name("huella-flush".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        // failures are logged inside; the next tick tries again
                        let _ = worker_store.flush_if_changed();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        tracing::debug!(interval_ms = interval.as_millis() as u64, "flush worker started");
        Ok(Self {
            store,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn store(&self) -> &Arc<RecordingStore> {
        &self.store
    }

    /// Stop the thread and flush one last time
    pub fn shutdown(mut self) -> Result<FlushOutcome, FlushError> {
        self.finish().unwrap_or(Ok(FlushOutcome::Unchanged))
    }

    fn finish(&mut self) -> Option<Result<FlushOutcome, FlushError>> {
        let handle = self.handle.take()?;
        drop(self.stop.take());
        if handle.join().is_err() {
            tracing::error!("flush worker panicked");
        }
        Some(self.store.flush_if_changed())
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
