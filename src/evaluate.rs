use std::path::Path;
use std::process::Command;

use log::{info, warn};

use crate::error::EvaluationError;

/// Scores a finished task. Invoked once per finalize.
pub trait Evaluator {
    fn evaluate(&mut self, task_id: &str, trajectory_root: &Path) -> Result<f64, EvaluationError>;
}

impl<T: Evaluator + ?Sized> Evaluator for Box<T> {
    fn evaluate(&mut self, task_id: &str, trajectory_root: &Path) -> Result<f64, EvaluationError> {
        (**self).evaluate(task_id, trajectory_root)
    }
}

/// Used when no evaluator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvaluator;

impl Evaluator for NullEvaluator {
    fn evaluate(&mut self, _task_id: &str, _trajectory_root: &Path) -> Result<f64, EvaluationError> {
        Err(EvaluationError::Unavailable)
    }
}

/// Runs an external program as `<program> <args..> <task_id> <trajectory_root>`
/// and reads the score from the last non-empty line of its stdout.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a whitespace-separated command line. `None` when blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&mut self, task_id: &str, trajectory_root: &Path) -> Result<f64, EvaluationError> {
        info!("evaluating {task_id} with `{}`", self.describe());
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(task_id)
            .arg(trajectory_root)
            .output()
            .map_err(|source| EvaluationError::Spawn {
                command: self.describe(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("evaluator failed ({}): {stderr}", output.status);
            return Err(EvaluationError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_score(&stdout).ok_or_else(|| EvaluationError::Unparsable {
            output: stdout.trim().to_string(),
        })
    }
}

fn parse_score(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|s| s.is_finite())
}
