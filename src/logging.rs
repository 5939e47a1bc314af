//! Run log setup. Records go to stderr and to a timestamped file under
//! `<result_dir>/logs/`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

pub const LOG_DIR: &str = "logs";

/// `viewport-sft-20240131@142500.log`
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("viewport-sft-{}.log", started.format("%Y%m%d@%H%M%S"))
}

/// Writes everything to both sinks.
pub struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

/// Installs the global logger with `level` as the default filter (`RUST_LOG`
/// still wins) and returns the path of the run log file.
pub fn init(level: &str, result_dir: &Path) -> io::Result<PathBuf> {
    let dir = result_dir.join(LOG_DIR);
    fs::create_dir_all(&dir)?;
    let path = dir.join(log_file_name(Local::now()));
    let file = File::create(&path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(Box::new(Tee::new(io::stderr(), file))))
        .init();
    Ok(path)
}
