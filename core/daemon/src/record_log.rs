//! Append-only JSON-lines history log.
//!
//! One record per line. Appends go through a small pool of writer threads
//! fed by a bounded queue. While the queue has room, merging never touches
//! the disk; a full queue makes the merging thread wait for a free slot
//! instead of buffering without limit. The log is best-effort and failed
//! appends are logged and dropped.

use crossbeam_channel::{bounded, Sender, TrySendError};
use fs_err as fs;
use histd_protocol::Record;
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to serialize record for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error while {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LogError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Appends `record` as a single line, creating the file if needed.
pub fn append_record(record: &Record, path: &Path) -> Result<(), LogError> {
    let mut line = serde_json::to_vec(record).map_err(|source| LogError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    line.push(b'\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LogError::Io {
            operation: "opening history log",
            source,
        })?;
    file.write_all(&line).map_err(|source| LogError::Io {
        operation: "appending to history log",
        source,
    })
}

/// Streams every parseable record in the log to `visit`, oldest first.
/// Returns the number of records visited.
pub fn read_records<F>(path: &Path, mut visit: F) -> Result<usize, LogError>
where
    F: FnMut(Record),
{
    let file = fs::File::open(path).map_err(|source| LogError::Io {
        operation: "opening history log",
        source,
    })?;

    let mut visited = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| LogError::Io {
            operation: "reading history log",
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(record) => {
                visit(record);
                visited += 1;
            }
            Err(err) => {
                warn!(
                    line = index + 1,
                    path = %path.display(),
                    error = %err,
                    "Skipping unparseable history line"
                );
            }
        }
    }
    Ok(visited)
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct WriterStats {
    pub appended: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, result: &Result<(), LogError>) {
        match result {
            Ok(()) => self.appended.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

pub struct LogWriterPool {
    path: PathBuf,
    sender: Mutex<Option<Sender<Record>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl LogWriterPool {
    pub fn new(path: PathBuf, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = bounded::<Record>(capacity.max(1));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                let path = path.clone();
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for record in receiver.iter() {
                        let result = append_record(&record, &path);
                        if let Err(err) = &result {
                            warn!(
                                error = %err,
                                merge_id = %record.merge_id(),
                                "Dropping history record"
                            );
                        }
                        counters.record(&result);
                    }
                })
            })
            .collect();

        Self {
            path,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            counters,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues `record` for a background append. A full queue blocks the
    /// caller until a worker frees a slot. Once the pool is closed the
    /// record is appended on the calling thread instead.
    pub fn enqueue(&self, record: Record) {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|sender| sender.as_ref().cloned());
        let Some(sender) = sender else {
            self.append_now(&record);
            return;
        };

        match sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(
                    capacity = sender.capacity().unwrap_or(0),
                    "History writer queue full; waiting for a free slot"
                );
                if let Err(err) = sender.send(record) {
                    self.append_now(&err.into_inner());
                }
            }
            Err(TrySendError::Disconnected(record)) => {
                self.append_now(&record);
            }
        }
    }

    /// Appends on the calling thread. Used by the shutdown drain, which must
    /// not acknowledge before every pending half has been written.
    pub fn append_now(&self, record: &Record) -> bool {
        let result = append_record(record, &self.path);
        if let Err(err) = &result {
            warn!(error = %err, merge_id = %record.merge_id(), "Dropping history record");
        }
        self.counters.record(&result);
        result.is_ok()
    }

    /// Stops accepting queued work and waits until every queued record has
    /// been attempted.
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("History writer thread panicked");
            }
        }
        debug!(path = %self.path.display(), "History writer pool closed");
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            appended: self.counters.appended.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for LogWriterPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cmd_line: &str) -> Record {
        Record {
            session_id: "s1".to_string(),
            shlvl: 1,
            cmd_line: cmd_line.to_string(),
            parts_merged: true,
            ..Record::default()
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn append_creates_file_and_never_truncates() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("history.json");

        append_record(&record("ls"), &path).expect("first append");
        append_record(&record("pwd"), &path).expect("second append");

        let lines = lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""cmdLine":"ls""#));
        assert!(lines[1].contains(r#""cmdLine":"pwd""#));
    }

    #[test]
    fn append_reports_unopenable_path() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing-dir").join("history.json");
        let err = append_record(&record("ls"), &path).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn read_skips_garbage_lines() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("history.json");
        append_record(&record("ls"), &path).expect("append");
        {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("open");
            file.write_all(b"{not json\n\n").expect("write garbage");
        }
        append_record(&record("pwd"), &path).expect("append");

        let mut seen = Vec::new();
        let count = read_records(&path, |record| seen.push(record.cmd_line)).expect("read");
        assert_eq!(count, 2);
        assert_eq!(seen, vec!["ls", "pwd"]);
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let err = read_records(&temp_dir.path().join("nope.json"), |_| {}).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn pool_drains_queue_on_close() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("history.json");
        let pool = LogWriterPool::new(path.clone(), 2, 1);

        for index in 0..20 {
            pool.enqueue(record(&format!("cmd {}", index)));
        }
        pool.close();

        assert_eq!(lines(&path).len(), 20);
        assert_eq!(
            pool.stats(),
            WriterStats {
                appended: 20,
                failed: 0
            }
        );
    }

    #[test]
    fn full_queue_waits_for_a_slot_instead_of_dropping() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("history.json");
        let pool = Arc::new(LogWriterPool::new(path.clone(), 1, 1));

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for index in 0..250 {
                        pool.enqueue(record(&format!("cmd {} {}", producer, index)));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer thread");
        }
        pool.close();

        assert_eq!(lines(&path).len(), 1000);
        assert_eq!(pool.stats().appended, 1000);
    }

    #[test]
    fn enqueue_after_close_appends_inline() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("history.json");
        let pool = LogWriterPool::new(path.clone(), 1, 4);
        pool.close();

        pool.enqueue(record("late"));
        assert_eq!(lines(&path).len(), 1);
    }

    #[test]
    fn failed_appends_are_counted() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing-dir").join("history.json");
        let pool = LogWriterPool::new(path, 1, 4);
        assert!(!pool.append_now(&record("ls")));
        pool.close();
        assert_eq!(pool.stats().failed, 1);
    }
}
