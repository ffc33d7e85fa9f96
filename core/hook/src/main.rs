//! histd-hook: shell-side client for the histd history daemon.
//!
//! Called from the shell's preexec/precmd hooks. Capture subcommands never
//! fail the shell: errors are logged and the process exits 0.
//!
//! ## Subcommands
//!
//! - `preexec` / `postexec`: capture the two halves of a command
//! - `record`: forward a record read as JSON from stdin
//! - `session-end`: tell the daemon a shell has exited
//! - `recent`, `records`, `suggest`, `health`: query the daemon

mod collect;
mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};
use histd_protocol::Record;
use std::io::{self, Read};

use collect::{Environment, PostExec, PreExec};

#[derive(Parser)]
#[command(name = "histd-hook")]
#[command(about = "Shell history capture client for histd")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture the command line before it runs
    Preexec {
        #[arg(long)]
        session_id: String,

        #[arg(long, default_value_t = 1)]
        shlvl: i32,

        #[arg(long, allow_hyphen_values = true)]
        cmd_line: String,

        /// Correlates the two halves of one command
        #[arg(long)]
        record_id: Option<String>,
    },

    /// Capture the outcome after the command finished
    Postexec {
        #[arg(long)]
        session_id: String,

        #[arg(long, default_value_t = 1)]
        shlvl: i32,

        #[arg(long, allow_hyphen_values = true)]
        exit_code: i32,

        #[arg(long)]
        record_id: Option<String>,
    },

    /// Forward a record half (reads JSON from stdin)
    Record,

    /// Report that a shell session has ended
    SessionEnd {
        #[arg(long)]
        session_id: String,
    },

    /// Print recently used command lines, most recent last
    Recent {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print recently merged records as JSON lines, oldest first
    Records {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print command suggestions from the daemon's strategies
    Suggest,

    /// Print daemon health as JSON
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Preexec {
            session_id,
            shlvl,
            cmd_line,
            record_id,
        } => {
            let record = collect::build_pre_exec(
                &PreExec {
                    session_id: &session_id,
                    shlvl,
                    cmd_line: &cmd_line,
                    record_id: record_id.as_deref(),
                },
                Environment::capture(),
            );
            capture(&record);
        }
        Commands::Postexec {
            session_id,
            shlvl,
            exit_code,
            record_id,
        } => {
            let record = collect::build_post_exec(
                &PostExec {
                    session_id: &session_id,
                    shlvl,
                    exit_code,
                    record_id: record_id.as_deref(),
                },
                Environment::capture(),
            );
            capture(&record);
        }
        Commands::Record => match read_stdin_record() {
            Ok(record) => capture(&record),
            Err(e) => tracing::warn!(error = %e, "histd-hook record: invalid input"),
        },
        Commands::SessionEnd { session_id } => {
            if let Err(e) = daemon_client::send_session_end(&session_id) {
                tracing::warn!(error = %e, session = %session_id, "histd-hook session-end failed");
            }
        }
        Commands::Recent { limit } => query(|| {
            let view = daemon_client::recent_cmd_lines()?;
            let skip = limit.map_or(0, |limit| view.list.len().saturating_sub(limit));
            for cmd_line in view.list.iter().skip(skip) {
                println!("{}", cmd_line);
            }
            Ok(())
        }),
        Commands::Records { limit } => query(|| {
            for record in daemon_client::recent_records(Some(limit))? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }),
        Commands::Suggest => query(|| {
            for suggestion in daemon_client::suggestions()? {
                println!("# {}: {}", suggestion.title, suggestion.description);
                for candidate in &suggestion.candidates {
                    println!("{}", candidate);
                }
            }
            Ok(())
        }),
        Commands::Health => query(|| {
            let health = daemon_client::daemon_health()?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }),
    }
}

fn capture(record: &Record) {
    // Capture is non-critical: log and exit 0 so the shell is never disrupted.
    if let Err(e) = daemon_client::send_record(record) {
        tracing::warn!(
            error = %e,
            merge_id = %record.merge_id(),
            part_one = record.part_one,
            "histd-hook capture failed"
        );
    }
}

fn query<F>(run: F)
where
    F: FnOnce() -> Result<(), daemon_client::ClientError>,
{
    if let Err(e) = run() {
        eprintln!("histd-hook: {}", e);
        std::process::exit(1);
    }
}

fn read_stdin_record() -> Result<Record, String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|err| format!("Failed to read stdin: {}", err))?;
    serde_json::from_str(&input).map_err(|err| format!("Invalid record JSON: {}", err))
}
