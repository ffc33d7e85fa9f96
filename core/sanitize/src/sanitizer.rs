//! Anonymization of history records.
//!
//! Identifying tokens are replaced by truncated SHA-256 hex digests so the
//! log keeps its shape (same token, same hash) without its content. Words in
//! the whitelist and single characters pass through unchanged.

use fs_err as fs;
use histd_protocol::Record;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::{error, warn};
use url::Url;

use crate::error::SanitizeError;

/// Characters that end a `-x` / `--option` token.
const OPTION_ENDING_CHARS: &str = "\"$'\\#[]!><|;{}()*,?~&=`:@^/+%.";
/// Characters allowed inside an option besides letters and digits.
const OPTION_ALLOWED_CHARS: &str = "-_";

pub struct Sanitizer {
    hash_length: usize,
    whitelist: HashSet<String>,
}

impl Sanitizer {
    /// `hash_length` of 0 keeps full digests.
    pub fn new(hash_length: usize, whitelist: HashSet<String>) -> Self {
        Self {
            hash_length,
            whitelist,
        }
    }

    /// Loads a whitelist file with one word per line.
    pub fn from_whitelist_file(hash_length: usize, path: &Path) -> Result<Self, SanitizeError> {
        let contents = fs::read_to_string(path).map_err(|source| SanitizeError::Whitelist {
            path: path.to_path_buf(),
            source,
        })?;
        let whitelist = contents
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();
        Ok(Self::new(hash_length, whitelist))
    }

    /// Sanitizes every line of `input` into `output`. Returns the number of
    /// records written.
    pub fn sanitize_lines<R, W>(&self, input: R, output: &mut W) -> Result<usize, SanitizeError>
    where
        R: BufRead,
        W: Write,
    {
        let mut written = 0;
        for (index, line) in input.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let line_number = index + 1;

            let mut record: Record = serde_json::from_str(&line).map_err(|source| {
                error!(line = line_number, content = %line, "Decoding error");
                SanitizeError::Decode {
                    line: line_number,
                    source,
                }
            })?;
            self.sanitize_record(&mut record).map_err(|err| {
                error!(line = line_number, content = %line, "Sanitization error");
                err
            })?;
            let encoded = serde_json::to_string(&record).map_err(|source| {
                error!(line = line_number, content = %line, "Encoding error");
                SanitizeError::Encode {
                    line: line_number,
                    source,
                }
            })?;
            writeln!(output, "{}", encoded)?;
            written += 1;
        }
        output.flush()?;
        Ok(written)
    }

    pub fn sanitize_record(&self, record: &mut Record) -> Result<(), SanitizeError> {
        for path in [
            &mut record.pwd,
            &mut record.real_pwd,
            &mut record.pwd_after,
            &mut record.real_pwd_after,
            &mut record.git_dir,
            &mut record.git_real_dir,
            &mut record.git_dir_after,
            &mut record.git_real_dir_after,
            &mut record.home,
            &mut record.shell_env,
        ] {
            *path = self.sanitize_path(path);
        }

        // Hashed whole, never tokenized.
        record.host = self.hash_token(&record.host);
        record.login = self.hash_token(&record.login);
        record.machine_id = self.hash_token(&record.machine_id);

        record.git_origin_remote = self.sanitize_git_url(&record.git_origin_remote)?;
        record.git_origin_remote_after = self.sanitize_git_url(&record.git_origin_remote_after)?;

        record.cmd_length = record.cmd_line.len();
        record.cmd_line = self.sanitize_cmd_line(&record.cmd_line);
        record.recall_last_cmd_line = self.sanitize_cmd_line(&record.recall_last_cmd_line);

        if !record.recall_actions_raw.is_empty() {
            record.recall_actions_raw = sanitize_recall_actions(&record.recall_actions_raw)?;
        }

        record.sanitized = true;
        Ok(())
    }

    /// Hashes every `/`-separated component that is not whitelisted verbatim.
    pub fn sanitize_path(&self, path: &str) -> String {
        path.split('/')
            .map(|component| {
                if self.whitelist.contains(component) {
                    component.to_string()
                } else {
                    self.hash_token(component)
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn sanitize_cmd_line(&self, cmd_line: &str) -> String {
        let mut sanitized = String::with_capacity(cmd_line.len());
        let mut buffer = String::new();
        let mut option_detected = false;
        let (mut prev3, mut prev2, mut prev1) = (' ', ' ', ' ');

        for ch in cmd_line.chars() {
            if option_detected {
                if ch.is_whitespace() || OPTION_ENDING_CHARS.contains(ch) {
                    option_detected = false;
                    sanitized.push_str(&buffer);
                    buffer.clear();
                    sanitized.push(ch);
                } else if !is_word_char(ch) && !OPTION_ALLOWED_CHARS.contains(ch) {
                    self.flush_cmd_token(&mut buffer, &mut sanitized, cmd_line);
                    sanitized.push(ch);
                } else {
                    buffer.push(ch);
                }
            } else if !is_word_char(ch) {
                self.flush_cmd_token(&mut buffer, &mut sanitized, cmd_line);
                sanitized.push(ch);
            } else {
                if (prev2.is_whitespace() && prev1 == '-')
                    || (prev3.is_whitespace() && prev2 == '-' && prev1 == '-')
                {
                    option_detected = true;
                }
                buffer.push(ch);
            }
            prev3 = prev2;
            prev2 = prev1;
            prev1 = ch;
        }

        if option_detected {
            sanitized.push_str(&buffer);
        } else {
            self.flush_cmd_token(&mut buffer, &mut sanitized, cmd_line);
        }
        sanitized
    }

    pub fn sanitize_git_url(&self, raw: &str) -> Result<String, SanitizeError> {
        if raw.is_empty() {
            return Ok(String::new());
        }

        let normalized = if raw.contains("://") {
            raw.to_string()
        } else if let Some(ssh) = scp_to_ssh(raw) {
            ssh
        } else if raw.starts_with('/') {
            return Ok(format!("file://{}", self.sanitize_path(raw)));
        } else {
            return Ok(self.sanitize_path(raw));
        };

        let url = Url::parse(&normalized).map_err(|source| SanitizeError::GitUrl {
            url: raw.to_string(),
            source,
        })?;
        Ok(self.sanitize_url(&url))
    }

    /// Rebuilds `url` with every identifying part hashed. Passwords are dropped.
    fn sanitize_url(&self, url: &Url) -> String {
        if url.cannot_be_a_base() {
            return format!("{}:{}", url.scheme(), self.sanitize_token(url.path()));
        }

        let mut sanitized = format!("{}://", url.scheme());
        if !url.username().is_empty() {
            sanitized.push_str(&self.sanitize_token(url.username()));
            sanitized.push('@');
        }
        if let Some(host) = url.host_str() {
            sanitized.push_str(&self.sanitize_token(host));
        }
        if let Some(port) = url.port() {
            sanitized.push(':');
            sanitized.push_str(&self.sanitize_token(&port.to_string()));
        }
        sanitized.push_str(&self.sanitize_path(url.path()));
        if let Some(query) = url.query() {
            sanitized.push('?');
            sanitized.push_str(&self.sanitize_token(query));
        }
        if let Some(fragment) = url.fragment() {
            sanitized.push('#');
            sanitized.push_str(&self.sanitize_token(fragment));
        }
        sanitized
    }

    fn flush_cmd_token(&self, buffer: &mut String, sanitized: &mut String, cmd_line: &str) {
        if buffer.is_empty() {
            return;
        }
        sanitized.push_str(&self.sanitize_cmd_token(buffer, cmd_line));
        buffer.clear();
    }

    fn sanitize_cmd_token(&self, token: &str, cmd_line: &str) -> String {
        if token.len() <= 1 || self.is_whitelisted(token) {
            return token.to_string();
        }
        if token.chars().all(is_word_char) {
            return self.hash_token(token);
        }
        if !token.chars().any(is_word_char) {
            return token.to_string();
        }
        warn!(
            token,
            cmd_line, "Command token mixes letters or digits with other characters"
        );
        self.hash_token(token)
    }

    fn sanitize_token(&self, token: &str) -> String {
        if token.len() <= 1 || self.is_whitelisted(token) {
            return token.to_string();
        }
        self.hash_token(token)
    }

    pub fn hash_token(&self, token: &str) -> String {
        if token.is_empty() {
            return String::new();
        }
        let digest = Sha256::digest(token.as_bytes());
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{:02x}", byte);
        }
        if self.hash_length > 0 && hex.len() > self.hash_length {
            hex.truncate(self.hash_length);
        }
        hex
    }

    fn is_whitelisted(&self, token: &str) -> bool {
        self.whitelist.contains(&token.to_lowercase())
    }
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphabetic() || ch.is_numeric()
}

/// `user@host:path` to `ssh://user@host/path`.
fn scp_to_ssh(raw: &str) -> Option<String> {
    let (authority, path) = raw.split_once(':')?;
    if authority.is_empty() || authority.contains('/') {
        return None;
    }
    Some(format!(
        "ssh://{}/{}",
        authority,
        path.trim_start_matches('/')
    ))
}

/// Replaces each recalled prefix by its length:
/// `|||arrow_up:<prefix>` becomes `|||arrow_up:<len>`.
fn sanitize_recall_actions(raw: &str) -> Result<String, SanitizeError> {
    let divider = if raw.contains("|||") { "|||" } else { ";" };
    let separator = format!("{}arrow_", divider);
    let invalid = |reason: String| SanitizeError::RecallActions {
        raw: raw.to_string(),
        reason,
    };

    let mut sanitized = String::new();
    for (index, action) in raw.split(separator.as_str()).enumerate().skip(1) {
        if action.is_empty() {
            return Err(invalid(format!("action {} is empty", index)));
        }
        let (name, prefix_len) = if action.starts_with("up:") {
            ("arrow_up", recalled_prefix_len(action, "up:"))
        } else if action.starts_with("down:") {
            ("arrow_down", recalled_prefix_len(action, "down:"))
        } else {
            return Err(invalid(format!(
                "expected arrow_up or arrow_down, got arrow_{}",
                action
            )));
        };
        let _ = write!(sanitized, "|||{}:{}", name, prefix_len);
    }
    Ok(sanitized)
}

/// The recalled prefix starts one byte after the `up:`/`down:` marker.
fn recalled_prefix_len(action: &str, marker: &str) -> usize {
    action.len().saturating_sub(marker.len() + 1)
}
