//! File logging for the hook.
//!
//! The hook runs inside the user's interactive shell, so nothing is written
//! to stderr for capture commands. Logs go to `~/.histd/logs/hook.log.<date>`.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "HISTD_HOOK_LOG";

/// Installs the global subscriber. The returned guard must be held until
/// exit so buffered lines reach the file.
pub fn init() -> Option<WorkerGuard> {
    let dir = dirs::home_dir()?.join(".histd").join("logs");
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(&dir, "hook.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
