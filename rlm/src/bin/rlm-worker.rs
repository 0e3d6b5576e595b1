//! Persistent worker process.
//!
//! Reads one JSON request per line on stdin and answers on stdout until stdin
//! closes. Diagnostics go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use rlm::worker::WorkerLoop;
use rlm::worker::storage::StorageRoot;
use rlm::{exit_codes, logging};

/// Environment fallback for `--storage-root`.
const STORAGE_ROOT_ENV: &str = "RLM_STORAGE_ROOT";

#[derive(Parser)]
#[command(name = "rlm-worker", version, about = "Persistent code-execution worker")]
struct Cli {
    /// Directory the storage helpers may read and write.
    #[arg(long, value_name = "DIR")]
    storage_root: Option<PathBuf>,
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rlm-worker: {err:#}");
            ExitCode::from(exit_codes::FAILED)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let storage_root = cli
        .storage_root
        .or_else(|| std::env::var_os(STORAGE_ROOT_ENV).map(PathBuf::from))
        .map(|path| StorageRoot::open(&path))
        .transpose()?;
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout();
    WorkerLoop::new(stdin, stdout, storage_root).run()
}
