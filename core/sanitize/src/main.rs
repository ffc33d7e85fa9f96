//! histd-sanitize: produces an anonymized copy of a histd history log.
//!
//! Reads the log line by line and writes each record back with paths,
//! hosts, logins, git remotes and command tokens hashed.

mod error;
mod sanitizer;

use clap::Parser;
use fs_err as fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use error::SanitizeError;
use sanitizer::Sanitizer;

#[derive(Parser)]
#[command(name = "histd-sanitize")]
#[command(about = "Anonymize a histd history log")]
#[command(version)]
struct Args {
    /// History log to read (default: ~/.histd_history.json)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output file (default: stdout)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Trim hashes to N characters, 0 turns trimming off
    #[arg(long, default_value_t = 12)]
    trim_hashes: usize,

    /// Words kept verbatim (default: ~/.histd/sanitizer_data/whitelist.txt)
    #[arg(long)]
    whitelist: Option<PathBuf>,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let (input, whitelist) = match resolve_paths(&args) {
        Ok(paths) => paths,
        Err(err) => {
            error!(error = %err, "Failed to resolve default paths");
            std::process::exit(1);
        }
    };

    match run(&input, args.output.as_deref(), &whitelist, args.trim_hashes) {
        Ok(written) => info!(written, input = %input.display(), "Sanitized history log"),
        Err(err) => {
            error!(error = %err, "Sanitization failed");
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn resolve_paths(args: &Args) -> Result<(PathBuf, PathBuf), String> {
    let home = || dirs::home_dir().ok_or_else(|| "Home directory not found".to_string());
    let input = match &args.input {
        Some(path) => path.clone(),
        None => home()?.join(".histd_history.json"),
    };
    let whitelist = match &args.whitelist {
        Some(path) => path.clone(),
        None => home()?
            .join(".histd")
            .join("sanitizer_data")
            .join("whitelist.txt"),
    };
    Ok((input, whitelist))
}

fn run(
    input: &Path,
    output: Option<&Path>,
    whitelist: &Path,
    trim_hashes: usize,
) -> Result<usize, SanitizeError> {
    let sanitizer = Sanitizer::from_whitelist_file(trim_hashes, whitelist)?;
    let reader = fs::File::open(input).map_err(|source| SanitizeError::Input {
        path: input.to_path_buf(),
        source,
    })?;

    let writer: Box<dyn Write> = match output {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = BufWriter::new(writer);
    sanitizer.sanitize_lines(BufReader::new(reader), &mut writer)
}
