//! IPC protocol types and validation for histd.
//!
//! This crate is shared by the daemon, the shell hook and the sanitizer so
//! the record schema cannot drift between them. The daemon remains the
//! authority on validation; clients reuse the same types to build requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

mod record;

pub use record::{MergeError, Record};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Record,
    SessionEnd,
    GetRecentCmdLines,
    GetSuggestions,
    GetRecentRecords,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionEnd {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RecentRecordsParams {
    /// Most recent N merged records; all buffered records when absent.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Snapshot of the daemon's recency index: distinct command lines, least
/// recent first, and the position of each line in `list`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct HistlistView {
    pub list: Vec<String>,
    pub last_index: HashMap<String, usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SuggestionView {
    pub title: String,
    pub description: String,
    pub candidates: Vec<String>,
}

pub fn parse_record(params: Value) -> Result<Record, ErrorInfo> {
    let record: Record = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("record payload is invalid JSON: {}", err),
        )
    })?;
    require_session_id(&record.session_id, "sessionId")?;
    if record.part_one && record.cmd_line.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            "cmdLine is required on the pre-exec half",
        ));
    }
    Ok(record)
}

pub fn parse_session_end(params: Value) -> Result<SessionEnd, ErrorInfo> {
    let end: SessionEnd = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("session_end payload is invalid JSON: {}", err),
        )
    })?;
    require_session_id(&end.session_id, "session_id")?;
    Ok(end)
}

pub fn parse_recent_records(params: Option<Value>) -> Result<RecentRecordsParams, ErrorInfo> {
    match params {
        None | Some(Value::Null) => Ok(RecentRecordsParams::default()),
        Some(params) => serde_json::from_value(params).map_err(|err| {
            ErrorInfo::new(
                "invalid_params",
                format!("get_recent_records payload is invalid JSON: {}", err),
            )
        }),
    }
}

fn require_session_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > 256 {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("{} must be 256 characters or fewer", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pre_exec_record() {
        let record = parse_record(json!({
            "sessionId": "s1",
            "shlvl": 1,
            "partOne": true,
            "cmdLine": "ls -la"
        }))
        .expect("valid record");
        assert_eq!(record.merge_id(), "s1_1");
    }

    #[test]
    fn post_exec_record_needs_no_cmd_line() {
        let record = parse_record(json!({
            "sessionId": "s1",
            "shlvl": 1,
            "partOne": false,
            "exitCode": 1
        }))
        .expect("valid record");
        assert_eq!(record.exit_code, 1);
    }

    #[test]
    fn rejects_record_without_session() {
        let err = parse_record(json!({"shlvl": 1, "partOne": false})).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_pre_exec_without_cmd_line() {
        let err = parse_record(json!({"sessionId": "s1", "partOne": true})).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_malformed_record() {
        let err = parse_record(json!({"sessionId": 42})).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn session_end_rejects_unknown_fields() {
        let err = parse_session_end(json!({"session_id": "s1", "pid": 3})).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn session_end_requires_id() {
        let err = parse_session_end(json!({"session_id": "  "})).unwrap_err();
        assert_eq!(err.code, "missing_field");
        assert_eq!(
            parse_session_end(json!({"session_id": "s1"})).expect("valid"),
            SessionEnd {
                session_id: "s1".to_string()
            }
        );
    }

    #[test]
    fn recent_records_params_are_optional() {
        assert_eq!(
            parse_recent_records(None).expect("no params"),
            RecentRecordsParams { limit: None }
        );
        assert_eq!(
            parse_recent_records(Some(json!({"limit": 5})))
                .expect("limit")
                .limit,
            Some(5)
        );
        let err = parse_recent_records(Some(json!({"limit": -1}))).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn method_names_are_snake_case() {
        let request: Request = serde_json::from_value(json!({
            "protocol_version": 1,
            "method": "get_recent_cmd_lines"
        }))
        .expect("request");
        assert!(matches!(request.method, Method::GetRecentCmdLines));
    }
}
