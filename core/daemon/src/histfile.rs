//! Session-keyed merge store.
//!
//! Pre-exec halves wait in the session table until their post-exec half
//! arrives; the merged record is published to the recency index, the
//! recent-records buffer and the registered strategies, then queued for the
//! history log. Two independent locks guard the state:
//!
//! - `sessions`: pending halves keyed by merge id.
//! - `recent`: recency index, recent-records buffer and strategies.
//!
//! No code path holds both at once.

use histd_protocol::{HistlistView, Record, SuggestionView};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::recency::RecencyIndex;
use crate::record_log::{read_records, LogError, LogWriterPool, WriterStats};
use crate::strategy::Strategy;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to load history from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: LogError,
    },
}

/// What `submit` did with a half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Stashed,
    /// A pending pre-exec half was discarded in favour of the new one.
    Replaced,
    Merged,
    /// Post-exec half with nothing to merge with; dropped.
    Unmatched,
    MergeFailed,
}

#[derive(Default)]
struct RecentState {
    cmd_lines: RecencyIndex,
    records: VecDeque<Record>,
    strategies: Vec<Box<dyn Strategy>>,
}

pub struct Histfile {
    sessions: Mutex<HashMap<String, Record>>,
    recent: Mutex<RecentState>,
    recent_records_limit: usize,
    writer: LogWriterPool,
}

impl Histfile {
    pub fn new(writer: LogWriterPool, recent_records_limit: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            recent: Mutex::new(RecentState::default()),
            recent_records_limit,
            writer,
        }
    }

    pub fn history_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn register_strategy(&self, strategy: Box<dyn Strategy>) {
        self.lock_recent().strategies.push(strategy);
    }

    /// Rebuilds the recency index and strategies from the history log.
    ///
    /// Only merged records count, matching what live merging publishes. A
    /// missing log is an empty history; any other failure is returned.
    pub fn load_history(&self, size_hint: usize) -> Result<usize, HistoryError> {
        let path = self.history_path().to_path_buf();
        info!(path = %path.display(), "Loading history");

        let mut recent = self.lock_recent();
        let mut cmd_lines = RecencyIndex::with_capacity(size_hint);
        for strategy in recent.strategies.iter_mut() {
            strategy.reset_history();
        }

        let result = read_records(&path, |record| {
            if !record.parts_merged || record.cmd_line.is_empty() {
                return;
            }
            cmd_lines.touch(&record.cmd_line);
            for strategy in recent.strategies.iter_mut() {
                strategy.add_history_record(&record);
            }
        });
        match result {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                info!(path = %path.display(), "No history log yet; starting empty");
            }
            Err(source) => {
                return Err(HistoryError::Load {
                    path: path.display().to_string(),
                    source,
                })
            }
        }

        // Lines merged before the load finished are newer than the log.
        if !recent.cmd_lines.is_empty() {
            let live = recent.cmd_lines.snapshot();
            for cmd_line in &live.list {
                cmd_lines.touch(cmd_line);
            }
        }
        recent.cmd_lines = cmd_lines;

        let count = recent.cmd_lines.len();
        info!(cmd_lines = count, "History loaded");
        Ok(count)
    }

    /// Accepts one half of a record.
    pub fn submit(&self, record: Record) -> SubmitOutcome {
        let merge_id = record.merge_id();

        if record.part_one {
            let previous = self.lock_sessions().insert(merge_id.clone(), record);
            if previous.is_some() {
                warn!(
                    merge_id = %merge_id,
                    "Got another pre-exec half before merging the previous one; overwriting"
                );
                return SubmitOutcome::Replaced;
            }
            debug!(merge_id = %merge_id, "Pre-exec half stashed");
            return SubmitOutcome::Stashed;
        }

        let pending = self.lock_sessions().remove(&merge_id);
        let Some(mut merged) = pending else {
            error!(
                merge_id = %merge_id,
                "Got post-exec half with nothing to merge it with; ignoring"
            );
            return SubmitOutcome::Unmatched;
        };

        if let Err(err) = merged.merge(record) {
            error!(merge_id = %merge_id, error = %err, "Failed to merge record halves");
            return SubmitOutcome::MergeFailed;
        }

        self.publish(&merged);
        self.writer.enqueue(merged);
        SubmitOutcome::Merged
    }

    fn publish(&self, record: &Record) {
        let mut recent = self.lock_recent();
        if self.recent_records_limit > 0 {
            if recent.records.len() >= self.recent_records_limit {
                recent.records.pop_front();
            }
            recent.records.push_back(record.clone());
        }
        recent.cmd_lines.touch(&record.cmd_line);
        for strategy in recent.strategies.iter_mut() {
            strategy.add_history_record(record);
        }
    }

    /// Flushes pending halves of an ended session without merging them.
    ///
    /// `session` is tried as an exact merge id first; if nothing matches it
    /// is treated as a session id and every shell level of that session is
    /// flushed. Returns the number of halves written.
    pub fn drop_session(&self, session: &str) -> usize {
        let orphans: Vec<(String, Record)> = {
            let mut sessions = self.lock_sessions();
            match sessions.remove(session) {
                Some(record) => vec![(session.to_string(), record)],
                None => {
                    let keys: Vec<String> = sessions
                        .iter()
                        .filter(|(_, record)| record.session_id == session)
                        .map(|(key, _)| key.clone())
                        .collect();
                    keys.into_iter()
                        .filter_map(|key| sessions.remove(&key).map(|record| (key, record)))
                        .collect()
                }
            }
        };

        if orphans.is_empty() {
            info!(session = %session, "No hanging parts for session");
            return 0;
        }

        let mut written = 0;
        for (merge_id, mut record) in orphans {
            info!(merge_id = %merge_id, "Dropping session; writing unmerged half");
            record.mark_incomplete();
            if self.writer.append_now(&record) {
                written += 1;
            }
        }
        written
    }

    /// Empties the session table, writing every pending half as incomplete,
    /// then waits for queued appends. Returns the number of halves written.
    pub fn flush_pending(&self) -> usize {
        let mut pending: Vec<(String, Record)> = self.lock_sessions().drain().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut written = 0;
        for (merge_id, mut record) in pending {
            warn!(merge_id = %merge_id, "Writing incomplete record on shutdown");
            record.mark_incomplete();
            if self.writer.append_now(&record) {
                written += 1;
            }
        }
        self.writer.close();
        written
    }

    pub fn recent_cmd_lines(&self) -> HistlistView {
        let recent = self.lock_recent();
        let snapshot = recent.cmd_lines.snapshot();
        debug!(cmd_lines = snapshot.list.len(), "History snapshot copied");
        snapshot
    }

    pub fn suggestions(&self) -> Vec<SuggestionView> {
        self.lock_recent()
            .strategies
            .iter()
            .map(|strategy| strategy.view())
            .collect()
    }

    pub fn pending_merge_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The newest `limit` buffered records (all when `None`), oldest first.
    pub fn recent_records(&self, limit: Option<usize>) -> Vec<Record> {
        let recent = self.lock_recent();
        let skip = limit.map_or(0, |limit| recent.records.len().saturating_sub(limit));
        recent.records.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> HistfileStats {
        let pending_halves = self.lock_sessions().len();
        let (cmd_lines, recent_records) = {
            let recent = self.lock_recent();
            (recent.cmd_lines.len(), recent.records.len())
        };
        HistfileStats {
            pending_halves,
            cmd_lines,
            recent_records,
            writer: self.writer.stats(),
        }
    }

    // A poisoned lock still guards consistent data: every mutation under
    // these locks is a single insert/remove/push.
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_recent(&self) -> MutexGuard<'_, RecentState> {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HistfileStats {
    pub pending_halves: usize,
    pub cmd_lines: usize,
    pub recent_records: usize,
    pub writer: WriterStats,
}
