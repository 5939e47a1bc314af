//! Action recorder: strictly ordered step records with before/after
//! screenshots, persisted as one directory per task.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use image::ImageFormat;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::Action;
use crate::error::{PersistenceError, SequenceError};
use crate::evaluate::Evaluator;
use crate::notebook;
use crate::vm::Screenshot;

pub const ACTION_LOG_FILE: &str = "trajectory.jsonl";
pub const SCORE_FILE: &str = "evaluation_score.txt";
pub const SESSION_LOG_FILE: &str = "session.log";
pub const METADATA_FILE: &str = "metadata.json";
pub const NOTEBOOK_FILE: &str = "notebook.ipynb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotTag {
    Before,
    After,
}

impl ShotTag {
    fn as_str(self) -> &'static str {
        match self {
            ShotTag::Before => "before",
            ShotTag::After => "after",
        }
    }
}

/// File name of a step screenshot, e.g. `step_0007_after.png`.
pub fn screenshot_file_name(index: usize, tag: ShotTag) -> String {
    format!("step_{index:04}_{}.png", tag.as_str())
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub index: usize,
    pub action: Action,
    /// `None` for the terminal `done` record and once flushed.
    pub screenshot_before: Option<Screenshot>,
    pub screenshot_after: Option<Screenshot>,
    pub timestamp: DateTime<Utc>,
    /// Screenshots are on disk and their buffers have been released.
    pub flushed: bool,
}

impl StepRecord {
    fn has_screenshots(&self) -> bool {
        self.flushed || self.screenshot_before.is_some()
    }
}

#[derive(Debug)]
struct PendingStep {
    screenshot_before: Screenshot,
    opened_at: DateTime<Utc>,
}

/// One line of `trajectory.jsonl`. Field order is part of the file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryLine {
    pub step: usize,
    pub action: Action,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub screenshot_before: Option<String>,
    pub screenshot_after: Option<String>,
}

impl TrajectoryLine {
    fn from_record(record: &StepRecord) -> Self {
        let shots = record.has_screenshots();
        let name = |tag| shots.then(|| screenshot_file_name(record.index, tag));
        Self {
            step: record.index,
            action: record.action.clone(),
            command: record.action.command(),
            timestamp: record.timestamp,
            screenshot_before: name(ShotTag::Before),
            screenshot_after: name(ShotTag::After),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// `None` for failures that belong to no single step, such as a checkpoint.
    pub step: Option<usize>,
    pub action: Option<Action>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Finished,
    Aborted,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub task_id: String,
    pub instruction: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub outcome: Outcome,
    pub complete: bool,
    pub abort_reason: Option<String>,
    /// Recorded actions, not counting the `done` marker.
    pub total_steps: usize,
    pub evaluation_score: f64,
    pub evaluation_error: Option<String>,
    pub incidents: Vec<Incident>,
}

#[derive(Debug, Clone)]
pub struct FinalizeReport {
    pub task_dir: PathBuf,
    pub score: f64,
    pub evaluation_error: Option<String>,
    pub files: Vec<PathBuf>,
}

/// How the session ended, as passed to [`TrajectoryRecorder::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Finished,
    Aborted { reason: String },
}

#[derive(Debug)]
pub struct TrajectoryRecorder {
    session_id: Uuid,
    instruction: String,
    started_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
    pending: Option<PendingStep>,
    incidents: Vec<Incident>,
    log: Vec<LogEntry>,
}

impl TrajectoryRecorder {
    pub fn new(session_id: Uuid, instruction: impl Into<String>) -> Self {
        Self {
            session_id,
            instruction: instruction.into(),
            started_at: Utc::now(),
            steps: Vec::new(),
            pending: None,
            incidents: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index the next completed step will receive.
    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_screenshot(&self) -> Option<&Screenshot> {
        self.pending.as_ref().map(|p| &p.screenshot_before)
    }

    pub fn is_sealed(&self) -> bool {
        self.steps.last().is_some_and(|s| s.action.is_done())
    }

    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    /// Latest frame known to the recorder: the pending before-shot, else the
    /// newest after-shot.
    pub fn latest_screenshot(&self) -> Option<&Screenshot> {
        self.pending_screenshot().or_else(|| {
            self.steps
                .iter()
                .rev()
                .find_map(|s| s.screenshot_after.as_ref())
        })
    }

    /// Opens a step. At most one step may be pending.
    pub fn begin_step(&mut self, screenshot_before: Screenshot) -> Result<usize, SequenceError> {
        if self.is_sealed() {
            return Err(SequenceError::Sealed);
        }
        if self.pending.is_some() {
            return Err(SequenceError::StepAlreadyPending {
                pending: self.next_index(),
            });
        }
        self.pending = Some(PendingStep {
            screenshot_before,
            opened_at: Utc::now(),
        });
        Ok(self.next_index())
    }

    /// Closes the pending step with the action that was executed.
    pub fn complete_step(
        &mut self,
        action: Action,
        screenshot_after: Screenshot,
    ) -> Result<&StepRecord, SequenceError> {
        if action.is_done() {
            return Err(SequenceError::MisplacedDone);
        }
        let pending = self.pending.take().ok_or(SequenceError::NoPendingStep)?;
        let index = self.next_index();
        self.note(format!("step {index}: {}", action.command()));
        self.steps.push(StepRecord {
            index,
            action,
            screenshot_before: Some(pending.screenshot_before),
            screenshot_after: Some(screenshot_after),
            timestamp: Utc::now(),
            flushed: false,
        });
        Ok(&self.steps[index])
    }

    /// Replaces the before-shot of the pending step with a fresher capture.
    pub fn refresh_pending(&mut self, screenshot: Screenshot) -> Result<(), SequenceError> {
        let pending = self.pending.as_mut().ok_or(SequenceError::NoPendingStep)?;
        pending.screenshot_before = screenshot;
        pending.opened_at = Utc::now();
        Ok(())
    }

    /// Appends the terminal `done` record. A pending step is discarded since
    /// no action was taken on it.
    pub fn append_done(&mut self) -> Result<&StepRecord, SequenceError> {
        if self.is_sealed() {
            return Err(SequenceError::Sealed);
        }
        Ok(self.push_done())
    }

    fn push_done(&mut self) -> &StepRecord {
        let index = self.next_index();
        if let Some(p) = self.pending.take() {
            debug!("dropping open step {index} (opened {})", p.opened_at);
        }
        self.note(format!("step {index}: {}", Action::Done.command()));
        self.steps.push(StepRecord {
            index,
            action: Action::Done,
            screenshot_before: None,
            screenshot_after: None,
            timestamp: Utc::now(),
            flushed: false,
        });
        &self.steps[index]
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    pub fn record_incident(
        &mut self,
        step: Option<usize>,
        action: Option<Action>,
        error: impl Into<String>,
    ) {
        let error = error.into();
        match step {
            Some(step) => self.note(format!("step {step}: {error}")),
            None => self.note(error.clone()),
        }
        self.incidents.push(Incident {
            step,
            action,
            error,
            timestamp: Utc::now(),
        });
    }

    /// Persists the trajectory under `output_root/task_id` and runs the
    /// evaluator.
    ///
    /// Seals the trajectory with `done` first if that has not happened yet.
    /// Each file is written to a temporary name and renamed into place. On
    /// failure the files already written stay where they are, so finalize can
    /// simply be called again.
    pub fn finalize(
        &mut self,
        output_root: &Path,
        task_id: &str,
        evaluator: &mut dyn Evaluator,
        end: &SessionEnd,
    ) -> Result<FinalizeReport, PersistenceError> {
        if !self.is_sealed() {
            self.push_done();
        }

        let task_dir = output_root.join(task_id);
        fs::create_dir_all(&task_dir).map_err(|e| PersistenceError::new(&task_dir, e))?;
        let mut files = self.flush_screenshots(&task_dir)?;
        files.push(self.write_action_log(&task_dir)?);

        let (score, evaluation_error) = match evaluator.evaluate(task_id, &task_dir) {
            Ok(score) => {
                info!("task {task_id} scored {score}");
                (score, None)
            }
            Err(e) => {
                error!("evaluation of {task_id} failed: {e}");
                (0.0, Some(e.to_string()))
            }
        };
        files.push(write_file(&task_dir.join(SCORE_FILE), score.to_string().as_bytes())?);

        let finished_at = Utc::now();
        let metadata = self.metadata(task_id, end, finished_at, score, evaluation_error.clone());

        let nb = notebook::build(&metadata, &self.lines());
        let nb_bytes = serde_json::to_vec_pretty(&nb)
            .map_err(|e| PersistenceError::new(task_dir.join(NOTEBOOK_FILE), e.into()))?;
        files.push(write_file(&task_dir.join(NOTEBOOK_FILE), &nb_bytes)?);

        files.push(write_file(
            &task_dir.join(SESSION_LOG_FILE),
            self.render_session_log(&metadata).as_bytes(),
        )?);

        let meta_bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| PersistenceError::new(task_dir.join(METADATA_FILE), e.into()))?;
        files.push(write_file(&task_dir.join(METADATA_FILE), &meta_bytes)?);

        if !metadata.complete {
            warn!("task {task_id} persisted as incomplete ({} steps)", metadata.total_steps);
        }
        info!("saved {} files to {}", files.len(), task_dir.display());

        Ok(FinalizeReport {
            task_dir,
            score,
            evaluation_error,
            files,
        })
    }

    /// Writes the screenshots of completed steps and the action log so far,
    /// then releases the image buffers. Returns the number of records written.
    ///
    /// Later checkpoints and [`Self::finalize`] only write what is new.
    pub fn checkpoint(&mut self, output_root: &Path, task_id: &str) -> Result<usize, PersistenceError> {
        let task_dir = output_root.join(task_id);
        fs::create_dir_all(&task_dir).map_err(|e| PersistenceError::new(&task_dir, e))?;
        let fresh = self.steps.iter().filter(|s| s.screenshot_before.is_some()).count();
        self.flush_screenshots(&task_dir)?;
        self.write_action_log(&task_dir)?;
        self.note(format!("checkpoint: {} records on disk", self.steps.len()));
        info!("checkpointed {fresh} new steps to {}", task_dir.display());
        Ok(fresh)
    }

    fn flush_screenshots(&mut self, task_dir: &Path) -> Result<Vec<PathBuf>, PersistenceError> {
        let mut files = Vec::new();
        for record in self.steps.iter_mut().filter(|s| !s.flushed) {
            let shots = [
                (ShotTag::Before, &record.screenshot_before),
                (ShotTag::After, &record.screenshot_after),
            ];
            for (tag, shot) in shots {
                if let Some(img) = shot {
                    let path = task_dir.join(screenshot_file_name(record.index, tag));
                    write_png(&path, img)?;
                    files.push(path);
                }
            }
            if !record.action.is_done() {
                record.screenshot_before = None;
                record.screenshot_after = None;
                record.flushed = true;
            }
        }
        Ok(files)
    }

    fn write_action_log(&self, task_dir: &Path) -> Result<PathBuf, PersistenceError> {
        let path = task_dir.join(ACTION_LOG_FILE);
        let mut action_log = String::new();
        for record in &self.steps {
            let line = serde_json::to_string(&TrajectoryLine::from_record(record))
                .map_err(|e| PersistenceError::new(&path, e.into()))?;
            action_log.push_str(&line);
            action_log.push('\n');
        }
        write_file(&path, action_log.as_bytes())
    }

    pub fn lines(&self) -> Vec<TrajectoryLine> {
        self.steps.iter().map(TrajectoryLine::from_record).collect()
    }

    fn metadata(
        &self,
        task_id: &str,
        end: &SessionEnd,
        finished_at: DateTime<Utc>,
        score: f64,
        evaluation_error: Option<String>,
    ) -> SessionMetadata {
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0);
        let (outcome, abort_reason) = match end {
            SessionEnd::Finished => (Outcome::Finished, None),
            SessionEnd::Aborted { reason } => (Outcome::Aborted, Some(reason.clone())),
        };
        SessionMetadata {
            session_id: self.session_id,
            task_id: task_id.to_string(),
            instruction: self.instruction.clone(),
            started_at: self.started_at,
            finished_at,
            duration_seconds: (duration_ms as f64 / 10.0).round() / 100.0,
            outcome,
            complete: outcome == Outcome::Finished,
            abort_reason,
            total_steps: self.steps.iter().filter(|s| !s.action.is_done()).count(),
            evaluation_score: score,
            evaluation_error,
            incidents: self.incidents.clone(),
        }
    }

    fn render_session_log(&self, meta: &SessionMetadata) -> String {
        let rule = "=====================================";
        let mut out = String::new();
        out.push_str("Viewport SFT Session Log\n");
        out.push_str(rule);
        out.push('\n');
        out.push_str(&format!("Session: {}\n", meta.session_id));
        out.push_str(&format!("Task: {}\n", meta.task_id));
        out.push_str(&format!("Instruction: {}\n", meta.instruction));
        out.push_str(&format!("Total Steps: {}\n", meta.total_steps));
        out.push_str(&format!("Duration: {}s\n", meta.duration_seconds));
        out.push_str(&format!("Evaluation Score: {}\n", meta.evaluation_score));
        match &meta.abort_reason {
            Some(reason) => out.push_str(&format!("Outcome: aborted ({reason})\n")),
            None => out.push_str("Outcome: finished\n"),
        }
        out.push_str(rule);
        out.push('\n');
        for entry in &self.log {
            out.push_str(&format!(
                "[{}] {}\n",
                entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                entry.message
            ));
        }
        out
    }
}

fn write_png(path: &Path, img: &Screenshot) -> Result<(), PersistenceError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| PersistenceError::new(path, std::io::Error::other(e)))?;
    write_file(path, &buf).map(|_| ())
}

/// Writes via a `.partial` sibling and a rename.
fn write_file(path: &Path, bytes: &[u8]) -> Result<PathBuf, PersistenceError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".partial");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes).map_err(|e| PersistenceError::new(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PersistenceError::new(path, e))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::MouseButton;
    use crate::error::EvaluationError;

    struct FixedScore(f64);

    impl Evaluator for FixedScore {
        fn evaluate(&mut self, _: &str, root: &Path) -> Result<f64, EvaluationError> {
            assert!(root.join(ACTION_LOG_FILE).exists(), "action log written before evaluation");
            Ok(self.0)
        }
    }

    fn shot(shade: u8) -> Screenshot {
        Screenshot::from_pixel(4, 3, image::Rgba([shade, shade, shade, 255]))
    }

    fn click(x: i32, y: i32) -> Action {
        Action::Click { x, y, button: MouseButton::Left }
    }

    #[test]
    fn begin_twice_is_a_sequence_error() {
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        rec.begin_step(shot(0)).unwrap();
        assert_eq!(
            rec.begin_step(shot(1)),
            Err(SequenceError::StepAlreadyPending { pending: 0 })
        );
    }

    #[test]
    fn complete_twice_is_a_sequence_error() {
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        rec.begin_step(shot(0)).unwrap();
        rec.complete_step(click(1, 1), shot(1)).unwrap();
        assert_eq!(
            rec.complete_step(click(2, 2), shot(2)).unwrap_err(),
            SequenceError::NoPendingStep
        );
    }

    #[test]
    fn done_goes_through_append_done() {
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        rec.begin_step(shot(0)).unwrap();
        assert_eq!(
            rec.complete_step(Action::Done, shot(1)).unwrap_err(),
            SequenceError::MisplacedDone
        );
        assert!(rec.has_pending());
    }

    #[test]
    fn indices_are_dense_and_done_is_last() {
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        for i in 0..3 {
            assert_eq!(rec.begin_step(shot(i)).unwrap(), i as usize);
            rec.complete_step(click(i as i32, 0), shot(i + 10)).unwrap();
        }
        rec.begin_step(shot(99)).unwrap();
        rec.append_done().unwrap();

        let indices: Vec<usize> = rec.steps().iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(rec.steps()[3].action.is_done());
        assert!(rec.steps()[3].screenshot_before.is_none());
        assert!(!rec.has_pending());
        assert_eq!(rec.begin_step(shot(0)), Err(SequenceError::Sealed));
        assert_eq!(rec.append_done().unwrap_err(), SequenceError::Sealed);
    }

    #[test]
    fn refresh_replaces_pending_before_shot() {
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        assert_eq!(rec.refresh_pending(shot(1)), Err(SequenceError::NoPendingStep));
        rec.begin_step(shot(1)).unwrap();
        rec.refresh_pending(shot(2)).unwrap();
        assert_eq!(rec.pending_screenshot().unwrap().get_pixel(0, 0)[0], 2);
    }

    #[test]
    fn finalize_writes_the_task_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "Open the file");
        rec.begin_step(shot(0)).unwrap();
        rec.complete_step(click(250, 150), shot(1)).unwrap();
        rec.begin_step(shot(1)).unwrap();
        rec.complete_step(Action::Type { text: "hello".into() }, shot(2)).unwrap();
        rec.append_done().unwrap();

        let report = rec
            .finalize(root.path(), "os/task-1", &mut FixedScore(1.0), &SessionEnd::Finished)
            .unwrap();

        let dir = root.path().join("os/task-1");
        assert_eq!(report.task_dir, dir);
        for name in [
            "step_0000_before.png",
            "step_0000_after.png",
            "step_0001_before.png",
            "step_0001_after.png",
        ] {
            assert!(dir.join(name).is_file(), "{name} missing");
        }
        assert!(!dir.join("step_0002_before.png").exists());

        let log = fs::read_to_string(dir.join(ACTION_LOG_FILE)).unwrap();
        let lines: Vec<TrajectoryLine> =
            log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].command, "pyautogui.click(250, 150)");
        assert_eq!(lines[2].action, Action::Done);
        assert_eq!(lines[2].screenshot_after, None);
        assert!(log.lines().next().unwrap().starts_with(r#"{"step":0,"action":{"type":"click""#));

        assert_eq!(fs::read_to_string(dir.join(SCORE_FILE)).unwrap(), "1");
        let meta: SessionMetadata =
            serde_json::from_slice(&fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap();
        assert!(meta.complete);
        assert_eq!(meta.total_steps, 2);
        assert_eq!(meta.outcome, Outcome::Finished);
        assert!(dir.join(NOTEBOOK_FILE).is_file());
        assert!(fs::read_to_string(dir.join(SESSION_LOG_FILE)).unwrap().contains("Total Steps: 2"));
        assert!(fs::read_dir(&dir).unwrap().all(|e| {
            !e.unwrap().file_name().to_string_lossy().ends_with(".partial")
        }));
    }

    #[test]
    fn failed_evaluation_still_persists_zero() {
        let root = tempfile::tempdir().unwrap();
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        let report = rec
            .finalize(
                root.path(),
                "t",
                &mut crate::evaluate::NullEvaluator,
                &SessionEnd::Aborted { reason: "operator abort".into() },
            )
            .unwrap();
        assert_eq!(report.score, 0.0);
        assert!(report.evaluation_error.is_some());

        let meta: SessionMetadata =
            serde_json::from_slice(&fs::read(root.path().join("t").join(METADATA_FILE)).unwrap())
                .unwrap();
        assert!(!meta.complete);
        assert_eq!(meta.abort_reason.as_deref(), Some("operator abort"));
        assert_eq!(rec.len(), 1, "finalize seals with done");
    }

    #[test]
    fn checkpoint_releases_buffers_and_finalize_keeps_names() {
        let root = tempfile::tempdir().unwrap();
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        rec.begin_step(shot(0)).unwrap();
        rec.complete_step(click(1, 1), shot(1)).unwrap();
        rec.begin_step(shot(1)).unwrap();

        assert_eq!(rec.checkpoint(root.path(), "t").unwrap(), 1);
        assert!(rec.steps()[0].flushed);
        assert!(rec.steps()[0].screenshot_after.is_none());
        assert!(rec.has_pending());
        let dir = root.path().join("t");
        assert!(dir.join("step_0000_after.png").is_file());
        assert_eq!(fs::read_to_string(dir.join(ACTION_LOG_FILE)).unwrap().lines().count(), 1);

        rec.complete_step(click(2, 2), shot(2)).unwrap();
        assert_eq!(rec.checkpoint(root.path(), "t").unwrap(), 1);

        rec.finalize(root.path(), "t", &mut FixedScore(1.0), &SessionEnd::Finished)
            .unwrap();
        let lines = rec.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].screenshot_before.as_deref(), Some("step_0000_before.png"));
        assert_eq!(lines[1].screenshot_after.as_deref(), Some("step_0001_after.png"));
        assert_eq!(lines[2].screenshot_before, None);
    }

    #[test]
    fn session_log_is_chronological() {
        let root = tempfile::tempdir().unwrap();
        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        rec.note("session started");
        rec.begin_step(shot(0)).unwrap();
        rec.complete_step(click(250, 150), shot(1)).unwrap();
        rec.begin_step(shot(1)).unwrap();
        rec.record_incident(Some(1), None, "VM rejected the key");
        rec.record_incident(None, None, "checkpoint failed: disk full");
        rec.finalize(root.path(), "t", &mut FixedScore(1.0), &SessionEnd::Finished)
            .unwrap();

        let log = fs::read_to_string(root.path().join("t").join(SESSION_LOG_FILE)).unwrap();
        let at = |needle: &str| log.find(needle).unwrap_or_else(|| panic!("{needle} missing"));
        assert!(at("session started") < at("step 0: pyautogui.click(250, 150)"));
        assert!(at("step 0: pyautogui.click") < at("step 1: VM rejected the key"));
        assert!(at("step 1: VM rejected") < at("] checkpoint failed: disk full"));
        assert!(at("checkpoint failed") < at("step 1: DONE"));
        assert!(!log.contains("discarded"));

        let steps: Vec<Option<usize>> = rec.incidents().iter().map(|i| i.step).collect();
        assert_eq!(steps, vec![Some(1), None]);
    }

    #[test]
    fn unwritable_root_is_a_persistence_error() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let mut rec = TrajectoryRecorder::new(Uuid::new_v4(), "task");
        let err = rec
            .finalize(&blocker, "t", &mut FixedScore(0.0), &SessionEnd::Finished)
            .unwrap_err();
        assert!(err.path.starts_with(&blocker));
    }
}
