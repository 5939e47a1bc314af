mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::debug;

/// Check recorded task directories.
#[derive(Parser, Debug)]
#[command(name = "trajectory-inspect")]
struct Args {
    /// Task directories, e.g. ./SFT/os/<task>
    #[arg(required = true)]
    dirs: Vec<PathBuf>,
    /// Emit one JSON report per line instead of text
    #[arg(long)]
    json: bool,
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut failed = false;
    for dir in &args.dirs {
        debug!("inspecting {}", dir.display());
        let report = match report::inspect(dir) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("{}: {e:#}", dir.display());
                failed = true;
                continue;
            }
        };
        failed |= !report.is_ok();
        if args.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{report}");
        }
    }

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
