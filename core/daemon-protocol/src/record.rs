//! Shell command records as captured by the shell integration.
//!
//! Each command execution arrives in two halves: the pre-exec half carries
//! the command line and the environment it started in, the post-exec half
//! carries the exit status and the environment it finished in. Field names
//! are serialized in camelCase and are the on-disk contract of the history
//! log, so renaming one breaks every existing log and the sanitizer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("expected the pre-exec half as merge target (session {session_id})")]
    NotPartOne { session_id: String },

    #[error("expected a post-exec half to merge with (session {session_id})")]
    NotPartTwo { session_id: String },

    #[error("halves are from different sessions: {first} vs {second}")]
    SessionMismatch { first: String, second: String },

    #[error("halves belong to different command lines: {first:?} vs {second:?}")]
    CmdLineMismatch { first: String, second: String },

    #[error("halves carry different record ids: {first} vs {second}")]
    RecordIdMismatch { first: String, second: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Record {
    // Merge identity
    pub session_id: String,
    pub shlvl: i32,
    pub part_one: bool,
    pub record_id: String,

    pub cmd_line: String,
    pub exit_code: i32,

    pub pwd: String,
    pub real_pwd: String,
    pub pwd_after: String,
    pub real_pwd_after: String,

    pub git_dir: String,
    pub git_real_dir: String,
    pub git_origin_remote: String,
    pub git_dir_after: String,
    pub git_real_dir_after: String,
    pub git_origin_remote_after: String,

    pub home: String,
    pub shell: String,
    pub shell_env: String,
    pub lang: String,
    pub login: String,
    pub host: String,
    pub machine_id: String,

    /// Seconds since the epoch.
    pub realtime_before: f64,
    pub realtime_after: f64,
    pub realtime_duration: f64,
    pub timezone_before: String,
    pub timezone_after: String,

    pub cmd_length: usize,
    pub recall_last_cmd_line: String,
    pub recall_actions_raw: String,

    pub parts_merged: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub incomplete: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub sanitized: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Record {
    /// Key of the in-flight merge this half belongs to. Nested shells share
    /// a session id, so the shell level keeps their halves apart.
    pub fn merge_id(&self) -> String {
        format!("{}_{}", self.session_id, self.shlvl)
    }

    /// First word of the command line.
    pub fn command(&self) -> &str {
        self.cmd_line.split_whitespace().next().unwrap_or("")
    }

    /// Folds the post-exec half into this pre-exec half.
    ///
    /// On error `self` is left untouched.
    pub fn merge(&mut self, part_two: Record) -> Result<(), MergeError> {
        if !self.part_one {
            return Err(MergeError::NotPartOne {
                session_id: self.session_id.clone(),
            });
        }
        if part_two.part_one {
            return Err(MergeError::NotPartTwo {
                session_id: part_two.session_id,
            });
        }
        if self.session_id != part_two.session_id {
            return Err(MergeError::SessionMismatch {
                first: self.session_id.clone(),
                second: part_two.session_id,
            });
        }
        if !part_two.cmd_line.is_empty() && part_two.cmd_line != self.cmd_line {
            return Err(MergeError::CmdLineMismatch {
                first: self.cmd_line.clone(),
                second: part_two.cmd_line,
            });
        }
        if !self.record_id.is_empty()
            && !part_two.record_id.is_empty()
            && self.record_id != part_two.record_id
        {
            return Err(MergeError::RecordIdMismatch {
                first: self.record_id.clone(),
                second: part_two.record_id,
            });
        }

        self.exit_code = part_two.exit_code;
        self.pwd_after = part_two.pwd_after;
        self.real_pwd_after = part_two.real_pwd_after;
        self.git_dir_after = part_two.git_dir_after;
        self.git_real_dir_after = part_two.git_real_dir_after;
        self.git_origin_remote_after = part_two.git_origin_remote_after;
        self.realtime_after = part_two.realtime_after;
        self.timezone_after = part_two.timezone_after;
        if self.realtime_before > 0.0 && self.realtime_after > 0.0 {
            self.realtime_duration = self.realtime_after - self.realtime_before;
        }
        self.parts_merged = true;
        self.part_one = false;
        Ok(())
    }

    /// Flags a half that is persisted without its counterpart.
    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pre_exec(session_id: &str, shlvl: i32, cmd_line: &str) -> Record {
        Record {
            session_id: session_id.to_string(),
            shlvl,
            part_one: true,
            cmd_line: cmd_line.to_string(),
            pwd: "/home/user".to_string(),
            realtime_before: 100.0,
            ..Record::default()
        }
    }

    fn post_exec(session_id: &str, shlvl: i32) -> Record {
        Record {
            session_id: session_id.to_string(),
            shlvl,
            part_one: false,
            exit_code: 2,
            pwd_after: "/tmp".to_string(),
            realtime_after: 101.5,
            ..Record::default()
        }
    }

    #[test]
    fn merge_id_joins_session_and_shell_level() {
        assert_eq!(pre_exec("s1", 3, "ls").merge_id(), "s1_3");
    }

    #[test]
    fn command_is_first_word() {
        assert_eq!(pre_exec("s1", 1, "  git status -s").command(), "git");
        assert_eq!(pre_exec("s1", 1, "").command(), "");
    }

    #[test]
    fn merge_copies_post_exec_fields() {
        let mut record = pre_exec("s1", 1, "ls -la");
        record.merge(post_exec("s1", 1)).expect("merge");

        assert!(record.parts_merged);
        assert!(!record.part_one);
        assert_eq!(record.cmd_line, "ls -la");
        assert_eq!(record.pwd, "/home/user");
        assert_eq!(record.pwd_after, "/tmp");
        assert_eq!(record.exit_code, 2);
        assert!((record.realtime_duration - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_rejects_two_pre_exec_halves() {
        let mut record = pre_exec("s1", 1, "ls");
        let err = record.merge(pre_exec("s1", 1, "ls")).unwrap_err();
        assert!(matches!(err, MergeError::NotPartTwo { .. }));
        assert!(record.part_one);
        assert!(!record.parts_merged);
    }

    #[test]
    fn merge_rejects_post_exec_target() {
        let mut record = post_exec("s1", 1);
        let err = record.merge(post_exec("s1", 1)).unwrap_err();
        assert!(matches!(err, MergeError::NotPartOne { .. }));
    }

    #[test]
    fn merge_rejects_foreign_session() {
        let mut record = pre_exec("s1", 1, "ls");
        let err = record.merge(post_exec("s2", 1)).unwrap_err();
        assert_eq!(
            err,
            MergeError::SessionMismatch {
                first: "s1".to_string(),
                second: "s2".to_string()
            }
        );
    }

    #[test]
    fn merge_rejects_different_cmd_line_when_present() {
        let mut record = pre_exec("s1", 1, "ls");
        let mut second = post_exec("s1", 1);
        second.cmd_line = "pwd".to_string();
        assert!(matches!(
            record.merge(second),
            Err(MergeError::CmdLineMismatch { .. })
        ));
    }

    #[test]
    fn merge_rejects_different_record_ids() {
        let mut record = pre_exec("s1", 1, "ls");
        record.record_id = "a".to_string();
        let mut second = post_exec("s1", 1);
        second.record_id = "b".to_string();
        assert!(matches!(
            record.merge(second),
            Err(MergeError::RecordIdMismatch { .. })
        ));
    }

    #[test]
    fn sparse_payload_parses_with_defaults() {
        let record: Record =
            serde_json::from_str(r#"{"sessionId":"s1","shlvl":1,"partOne":false}"#)
                .expect("parse");
        assert_eq!(record.session_id, "s1");
        assert!(!record.part_one);
        assert!(record.cmd_line.is_empty());
    }

    #[test]
    fn incomplete_marker_only_serialized_when_set() {
        let mut record = pre_exec("s1", 1, "ls");
        let line = serde_json::to_string(&record).expect("serialize");
        assert!(!line.contains("incomplete"));
        assert!(line.contains(r#""cmdLine":"ls""#));

        record.mark_incomplete();
        let line = serde_json::to_string(&record).expect("serialize");
        assert!(line.contains(r#""incomplete":true"#));
    }
}
