//! Builds record halves from the shell's environment.
//!
//! Called from the shell's preexec/precmd hooks, so everything here is
//! best-effort: a value that cannot be read is left empty rather than
//! failing the capture.

use chrono::{Local, Utc};
use fs_err as fs;
use histd_protocol::Record;
use std::env;
use std::path::{Path, PathBuf};

/// Snapshot of the environment a half is captured in.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub pwd: String,
    pub real_pwd: String,
    pub git_dir: String,
    pub git_real_dir: String,
    pub git_origin_remote: String,
    pub home: String,
    pub shell: String,
    pub lang: String,
    pub login: String,
    pub host: String,
    pub machine_id: String,
    pub realtime: f64,
    pub timezone: String,
}

impl Environment {
    pub fn capture() -> Self {
        let pwd = env::current_dir().unwrap_or_default();
        let git_dir = find_git_dir(&pwd);
        let git_origin_remote = git_dir
            .as_deref()
            .and_then(|dir| fs::read_to_string(dir.join(".git").join("config")).ok())
            .and_then(|config| origin_remote(&config))
            .unwrap_or_default();

        Self {
            pwd: display(&pwd),
            real_pwd: display(&canonical(&pwd)),
            git_real_dir: git_dir
                .as_deref()
                .map(|dir| display(&canonical(dir)))
                .unwrap_or_default(),
            git_dir: git_dir.as_deref().map(display).unwrap_or_default(),
            git_origin_remote,
            home: dirs::home_dir().as_deref().map(display).unwrap_or_default(),
            shell: env::var("SHELL").unwrap_or_default(),
            lang: env::var("LANG").unwrap_or_default(),
            login: env::var("USER")
                .or_else(|_| env::var("LOGNAME"))
                .unwrap_or_default(),
            host: hostname(),
            machine_id: fs::read_to_string("/etc/machine-id")
                .map(|id| id.trim().to_string())
                .unwrap_or_default(),
            realtime: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            timezone: Local::now().format("%:z").to_string(),
        }
    }
}

pub struct PreExec<'a> {
    pub session_id: &'a str,
    pub shlvl: i32,
    pub cmd_line: &'a str,
    pub record_id: Option<&'a str>,
}

pub struct PostExec<'a> {
    pub session_id: &'a str,
    pub shlvl: i32,
    pub exit_code: i32,
    pub record_id: Option<&'a str>,
}

pub fn build_pre_exec(args: &PreExec<'_>, environment: Environment) -> Record {
    Record {
        session_id: args.session_id.to_string(),
        shlvl: args.shlvl,
        part_one: true,
        record_id: args.record_id.unwrap_or_default().to_string(),
        cmd_line: args.cmd_line.to_string(),
        cmd_length: args.cmd_line.len(),
        pwd: environment.pwd,
        real_pwd: environment.real_pwd,
        git_dir: environment.git_dir,
        git_real_dir: environment.git_real_dir,
        git_origin_remote: environment.git_origin_remote,
        home: environment.home,
        shell_env: environment.shell.clone(),
        shell: shell_name(&environment.shell),
        lang: environment.lang,
        login: environment.login,
        host: environment.host,
        machine_id: environment.machine_id,
        realtime_before: environment.realtime,
        timezone_before: environment.timezone,
        ..Record::default()
    }
}

pub fn build_post_exec(args: &PostExec<'_>, environment: Environment) -> Record {
    Record {
        session_id: args.session_id.to_string(),
        shlvl: args.shlvl,
        part_one: false,
        record_id: args.record_id.unwrap_or_default().to_string(),
        exit_code: args.exit_code,
        pwd_after: environment.pwd,
        real_pwd_after: environment.real_pwd,
        git_dir_after: environment.git_dir,
        git_real_dir_after: environment.git_real_dir,
        git_origin_remote_after: environment.git_origin_remote,
        realtime_after: environment.realtime,
        timezone_after: environment.timezone,
        ..Record::default()
    }
}

fn shell_name(shell_path: &str) -> String {
    Path::new(shell_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Nearest ancestor of `start` (inclusive) that contains a `.git` entry.
fn find_git_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Reads the `url` of `[remote "origin"]` from a git config file.
fn origin_remote(config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == r#"[remote "origin"]"#;
            continue;
        }
        if !in_origin {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "url" {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn hostname() -> String {
    let mut buffer = [0u8; 256];
    // SAFETY: the pointer and length describe `buffer`, which outlives the call.
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if rc != 0 {
        return env::var("HOSTNAME").unwrap_or_default();
    }
    let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}
