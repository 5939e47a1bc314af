use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use viewport_sft::trajectory::{
    ACTION_LOG_FILE, METADATA_FILE, NOTEBOOK_FILE, SCORE_FILE, SESSION_LOG_FILE, SessionMetadata,
    ShotTag, TrajectoryLine, screenshot_file_name,
};

#[derive(Debug, Serialize)]
pub struct Report {
    pub task_dir: PathBuf,
    pub records: usize,
    pub actions: usize,
    pub sealed: bool,
    pub complete: Option<bool>,
    pub score: Option<f64>,
    pub incidents: usize,
    pub problems: Vec<String>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.task_dir.display())?;
        writeln!(f, "  records:   {} ({} actions)", self.records, self.actions)?;
        writeln!(f, "  sealed:    {}", self.sealed)?;
        match self.complete {
            Some(c) => writeln!(f, "  complete:  {c}")?,
            None => writeln!(f, "  complete:  unknown")?,
        }
        match self.score {
            Some(s) => writeln!(f, "  score:     {s}")?,
            None => writeln!(f, "  score:     missing")?,
        }
        writeln!(f, "  incidents: {}", self.incidents)?;
        if self.problems.is_empty() {
            write!(f, "  OK")
        } else {
            for p in &self.problems {
                writeln!(f, "  problem: {p}")?;
            }
            write!(f, "  {} problem(s)", self.problems.len())
        }
    }
}

/// Checks a persisted task directory against the layout the recorder writes.
pub fn inspect(task_dir: &Path) -> Result<Report> {
    let log_path = task_dir.join(ACTION_LOG_FILE);
    let log = fs::read_to_string(&log_path)
        .with_context(|| format!("reading {}", log_path.display()))?;

    let mut problems = Vec::new();
    let mut lines = Vec::new();
    for (n, raw) in log.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        match serde_json::from_str::<TrajectoryLine>(raw) {
            Ok(line) => lines.push(line),
            Err(e) => problems.push(format!("line {}: {e}", n + 1)),
        }
    }

    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        if line.step != i {
            problems.push(format!("record {i} has step {}", line.step));
        }
        if line.action.is_done() {
            if i != last {
                problems.push(format!("done marker at step {i} is not last"));
            }
            if line.screenshot_before.is_some() || line.screenshot_after.is_some() {
                problems.push(format!("done marker at step {i} references screenshots"));
            }
            continue;
        }
        if line.command != line.action.command() {
            problems.push(format!("step {i}: command does not match action"));
        }
        for (tag, name) in [
            (ShotTag::Before, &line.screenshot_before),
            (ShotTag::After, &line.screenshot_after),
        ] {
            let expected = screenshot_file_name(i, tag);
            match name {
                Some(name) if *name != expected => {
                    problems.push(format!("step {i}: screenshot {name} should be {expected}"));
                }
                Some(name) if !task_dir.join(name).is_file() => {
                    problems.push(format!("step {i}: {name} is missing"));
                }
                Some(_) => {}
                None => problems.push(format!("step {i}: no {expected} recorded")),
            }
        }
    }

    let sealed = lines.last().is_some_and(|l| l.action.is_done());
    if !sealed {
        problems.push("trajectory does not end with a done marker".into());
    }
    let actions = lines.iter().filter(|l| !l.action.is_done()).count();

    let score = match fs::read_to_string(task_dir.join(SCORE_FILE)) {
        Ok(s) => match s.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                problems.push(format!("{SCORE_FILE} holds {:?}", s.trim()));
                None
            }
        },
        Err(_) => {
            problems.push(format!("{SCORE_FILE} is missing"));
            None
        }
    };

    let mut complete = None;
    let mut incidents = 0;
    match fs::read(task_dir.join(METADATA_FILE)) {
        Ok(bytes) => match serde_json::from_slice::<SessionMetadata>(&bytes) {
            Ok(meta) => {
                if meta.total_steps != actions {
                    problems.push(format!(
                        "metadata counts {} steps, log has {actions}",
                        meta.total_steps
                    ));
                }
                if score.is_some_and(|s| s != meta.evaluation_score) {
                    problems.push("metadata score differs from the score file".into());
                }
                complete = Some(meta.complete);
                incidents = meta.incidents.len();
            }
            Err(e) => problems.push(format!("{METADATA_FILE}: {e}")),
        },
        Err(_) => problems.push(format!("{METADATA_FILE} is missing")),
    }

    for name in [SESSION_LOG_FILE, NOTEBOOK_FILE] {
        if !task_dir.join(name).is_file() {
            problems.push(format!("{name} is missing"));
        }
    }

    let leftovers = fs::read_dir(task_dir)
        .with_context(|| format!("listing {}", task_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .count();
    if leftovers > 0 {
        problems.push(format!("{leftovers} unfinished .partial file(s)"));
    }

    Ok(Report {
        task_dir: task_dir.to_path_buf(),
        records: lines.len(),
        actions,
        sealed,
        complete,
        score,
        incidents,
        problems,
    })
}
