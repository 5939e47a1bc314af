//! The interaction loop: turns operator input into VM actions, one step at a
//! time, and feeds the results to the trajectory recorder.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{self, Action, MouseButton, ScrollDirection};
use crate::error::{PersistenceError, SessionError, VmError};
use crate::evaluate::Evaluator;
use crate::mapper::{Point, Size};
use crate::trajectory::{FinalizeReport, SessionEnd, TrajectoryRecorder};
use crate::viewport::{DEFAULT_PAN_MARGIN, DEFAULT_PAN_SPEED, ViewportController};
use crate::vm::{self, Screenshot, VmInterface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAction,
    Executing,
    Finished,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Aborted)
    }
}

/// Who owns keyboard and pointer input. Edge panning only runs for `Viewport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputFocus {
    #[default]
    Viewport,
    Overlay,
}

/// What the next viewport click does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerMode {
    #[default]
    Click,
    DragStart,
    /// Start point already chosen, in VM coordinates.
    DragEnd { start: Point },
}

/// Operator input, in window coordinates where positional.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    PointerMoved { position: Point },
    PointerClick { position: Point, button: MouseButton },
    Scroll { direction: ScrollDirection, amount: u32 },
    TypeText(String),
    Hotkey(Vec<String>),
    Key(String),
    Wait(f32),
    Refresh,
    ToggleDrag,
    ToggleOverlay,
    Finish,
    Abort,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pause between an action and the capture of its result.
    pub settle_delay: Duration,
    pub screenshot_attempts: u32,
    pub screenshot_retry_delay: Duration,
    /// Consecutive VM timeouts tolerated before the session aborts.
    pub max_consecutive_timeouts: u32,
    pub pan_margin: u32,
    pub pan_speed: f32,
    /// Flush screenshots to disk every this many recorded steps; 0 disables.
    pub checkpoint_every: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            screenshot_attempts: 3,
            screenshot_retry_delay: Duration::from_secs(1),
            max_consecutive_timeouts: 3,
            pan_margin: DEFAULT_PAN_MARGIN,
            pan_speed: DEFAULT_PAN_SPEED,
            checkpoint_every: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionTask {
    /// `<domain>/<task_name>`
    pub task_id: String,
    pub instruction: String,
}

/// An action that did not make it into the trajectory, waiting for the
/// operator to retry or skip it.
#[derive(Debug, Clone)]
pub struct FailedStep {
    pub index: usize,
    pub action: Action,
    pub error: VmError,
    /// The VM ran the action; only capturing its result failed.
    pub executed: bool,
}

#[derive(Debug)]
pub enum StepOutcome {
    Recorded { index: usize, action: Action },
    Refreshed,
    Ignored,
    Failed { index: usize, error: VmError },
    Finished(FinalizeReport),
    Aborted {
        reason: String,
        finalize: Result<FinalizeReport, PersistenceError>,
    },
}

pub struct Session<V: VmInterface, E: Evaluator> {
    vm: V,
    evaluator: E,
    task: SessionTask,
    output_root: PathBuf,
    options: SessionOptions,
    viewport: ViewportController,
    recorder: TrajectoryRecorder,
    state: SessionState,
    focus: InputFocus,
    pointer_mode: PointerMode,
    failed: Option<FailedStep>,
    consecutive_timeouts: u32,
    frame_generation: u64,
    end: Option<SessionEnd>,
    report: Option<FinalizeReport>,
}

impl<V: VmInterface, E: Evaluator> Session<V, E> {
    /// The VM frame size is unknown until the first capture; until then the
    /// viewport assumes the frame matches the window.
    pub fn new(
        vm: V,
        evaluator: E,
        task: SessionTask,
        output_root: impl Into<PathBuf>,
        window_size: Size,
        options: SessionOptions,
    ) -> Self {
        let viewport = ViewportController::new(window_size, window_size)
            .with_panning(options.pan_margin, options.pan_speed);
        let recorder = TrajectoryRecorder::new(Uuid::new_v4(), task.instruction.clone());
        Self {
            vm,
            evaluator,
            task,
            output_root: output_root.into(),
            options,
            viewport,
            recorder,
            state: SessionState::Idle,
            focus: InputFocus::Viewport,
            pointer_mode: PointerMode::Click,
            failed: None,
            consecutive_timeouts: 0,
            frame_generation: 0,
            end: None,
            report: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn focus(&self) -> InputFocus {
        self.focus
    }

    pub fn pointer_mode(&self) -> PointerMode {
        self.pointer_mode
    }

    pub fn viewport(&self) -> &ViewportController {
        &self.viewport
    }

    pub fn recorder(&self) -> &TrajectoryRecorder {
        &self.recorder
    }

    pub fn task(&self) -> &SessionTask {
        &self.task
    }

    pub fn failed_step(&self) -> Option<&FailedStep> {
        self.failed.as_ref()
    }

    pub fn has_failed_step(&self) -> bool {
        self.failed.is_some()
    }

    pub fn report(&self) -> Option<&FinalizeReport> {
        self.report.as_ref()
    }

    /// Frame the operator should be looking at.
    pub fn current_frame(&self) -> Option<&Screenshot> {
        self.recorder.latest_screenshot()
    }

    /// Bumped whenever [`Self::current_frame`] changes.
    pub fn frame_generation(&self) -> u64 {
        self.frame_generation
    }

    /// Captures the first frame and opens step 0.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Idle, "start")?;
        info!("starting session for {}", self.task.task_id);
        self.recorder.note(format!("task: {}", self.task.task_id));

        match self.capture() {
            Ok(shot) => {
                self.accept_frame(&shot);
                self.recorder.begin_step(shot)?;
                self.state = SessionState::AwaitingAction;
                Ok(())
            }
            Err(e) => {
                let reason = format!("initial screenshot failed: {e}");
                self.abort(reason.clone());
                Err(SessionError::Aborted { reason })
            }
        }
    }

    /// Advances edge panning. `cursor` is `None` when the pointer is outside
    /// the viewport.
    pub fn tick(&mut self, cursor: Option<Point>, dt: f32) -> Point {
        let pan = self.focus == InputFocus::Viewport && !self.state.is_terminal();
        match cursor {
            Some(c) => self.viewport.update(c, dt, pan),
            None => self.viewport.update(Point::ORIGIN, dt, false),
        }
    }

    /// Jumps the viewport, e.g. from a minimap click. The offset is clamped.
    pub fn pan_to(&mut self, offset: Point) {
        self.viewport.set_pan_offset(offset);
    }

    pub fn resize(&mut self, window_size: Size) {
        self.viewport.resize(window_size);
    }

    pub fn set_focus(&mut self, focus: InputFocus) {
        if self.focus != focus {
            debug!("input focus -> {focus:?}");
            self.focus = focus;
        }
    }

    pub fn handle(&mut self, event: RawEvent) -> Result<StepOutcome, SessionError> {
        match event {
            RawEvent::PointerMoved { .. } => Ok(StepOutcome::Ignored),
            RawEvent::ToggleOverlay => {
                self.set_focus(match self.focus {
                    InputFocus::Viewport => InputFocus::Overlay,
                    InputFocus::Overlay => InputFocus::Viewport,
                });
                Ok(StepOutcome::Ignored)
            }
            RawEvent::ToggleDrag => {
                self.pointer_mode = match self.pointer_mode {
                    PointerMode::Click => PointerMode::DragStart,
                    _ => PointerMode::Click,
                };
                Ok(StepOutcome::Ignored)
            }
            RawEvent::Finish => self.finish(),
            RawEvent::Abort => Ok(self.abort("operator abort")),
            RawEvent::Refresh => self.refresh(),
            RawEvent::PointerClick { position, button } => self.click(position, button),
            RawEvent::Scroll { direction, amount } => {
                self.execute(Action::Scroll { direction, amount: amount.max(1) })
            }
            RawEvent::TypeText(text) if text.is_empty() => Ok(StepOutcome::Ignored),
            RawEvent::TypeText(text) => self.execute(Action::Type { text }),
            RawEvent::Hotkey(keys) if keys.is_empty() => Ok(StepOutcome::Ignored),
            RawEvent::Hotkey(keys) => self.execute(Action::Hotkey { keys }),
            RawEvent::Key(name) => self.execute(Action::Key { name }),
            RawEvent::Wait(seconds) if !action::is_valid_wait(seconds) => {
                Err(SessionError::InvalidWait { seconds })
            }
            RawEvent::Wait(seconds) => self.execute(Action::Wait { seconds }),
        }
    }

    fn click(&mut self, position: Point, button: MouseButton) -> Result<StepOutcome, SessionError> {
        self.require(SessionState::AwaitingAction, "click")?;
        self.require_resolved()?;
        let target = self.viewport.to_vm(position);

        match (self.pointer_mode, button) {
            (PointerMode::Click, _) => self.execute(Action::Click {
                x: target.x,
                y: target.y,
                button,
            }),
            (_, MouseButton::Right) => {
                debug!("drag cancelled");
                self.pointer_mode = PointerMode::Click;
                Ok(StepOutcome::Ignored)
            }
            (PointerMode::DragStart, _) => {
                debug!("drag start at {target:?}");
                self.pointer_mode = PointerMode::DragEnd { start: target };
                Ok(StepOutcome::Ignored)
            }
            (PointerMode::DragEnd { start }, _) => {
                self.pointer_mode = PointerMode::Click;
                self.execute(Action::Drag {
                    start_x: start.x,
                    start_y: start.y,
                    end_x: target.x,
                    end_y: target.y,
                })
            }
        }
    }

    fn execute(&mut self, action: Action) -> Result<StepOutcome, SessionError> {
        self.require(SessionState::AwaitingAction, action.kind())?;
        self.require_resolved()?;
        let index = self.recorder.next_index();
        self.state = SessionState::Executing;
        info!("step {index}: {}", action.command());

        if let Err(e) = vm::dispatch(&mut self.vm, &action) {
            // A command that timed out may still have run in the VM, so a
            // retry only recaptures.
            let executed = e.is_timeout();
            return Ok(self.fail(index, Some((action, executed)), e));
        }
        if !matches!(action, Action::Wait { .. }) && !self.options.settle_delay.is_zero() {
            thread::sleep(self.options.settle_delay);
        }
        self.record_result(index, action)
    }

    /// Captures the after-shot of `action`, closes the step and opens the next.
    fn record_result(&mut self, index: usize, action: Action) -> Result<StepOutcome, SessionError> {
        let shot = match self.capture() {
            Ok(shot) => shot,
            Err(e) => return Ok(self.fail(index, Some((action, true)), e)),
        };
        self.consecutive_timeouts = 0;
        self.accept_frame(&shot);
        self.recorder.complete_step(action.clone(), shot.clone())?;
        self.recorder.begin_step(shot)?;
        self.state = SessionState::AwaitingAction;

        let every = self.options.checkpoint_every;
        if every > 0 && self.recorder.len() % every == 0 {
            if let Err(e) = self.checkpoint() {
                error!("checkpoint after step {index} failed: {e}");
            }
        }
        Ok(StepOutcome::Recorded { index, action })
    }

    /// Writes the steps recorded so far and frees their screenshots.
    pub fn checkpoint(&mut self) -> Result<usize, SessionError> {
        match self.recorder.checkpoint(&self.output_root, &self.task.task_id) {
            Ok(n) => Ok(n),
            Err(e) => {
                let message = format!("checkpoint failed: {e}");
                self.recorder.record_incident(None, None, message);
                Err(e.into())
            }
        }
    }

    /// Re-runs the failed step. When the action already reached the VM only
    /// the capture is repeated.
    pub fn retry(&mut self) -> Result<StepOutcome, SessionError> {
        let Some(failed) = self.failed.take() else {
            return Ok(StepOutcome::Ignored);
        };
        self.recorder.record_incident(
            Some(failed.index),
            Some(failed.action.clone()),
            "retried by operator",
        );
        if failed.executed {
            self.state = SessionState::Executing;
            self.record_result(failed.index, failed.action)
        } else {
            self.execute(failed.action)
        }
    }

    /// Drops the failed step and recaptures the screen for the next one.
    pub fn skip(&mut self) -> Result<StepOutcome, SessionError> {
        let Some(failed) = self.failed.take() else {
            return Ok(StepOutcome::Ignored);
        };
        warn!("skipping step {}: {}", failed.index, failed.action.command());
        self.recorder.record_incident(
            Some(failed.index),
            Some(failed.action),
            "skipped by operator",
        );
        self.refresh()
    }

    /// Replaces the pending before-shot with a fresh capture.
    pub fn refresh(&mut self) -> Result<StepOutcome, SessionError> {
        self.require(SessionState::AwaitingAction, "refresh")?;
        let index = self.recorder.next_index();
        match self.capture() {
            Ok(shot) => {
                self.consecutive_timeouts = 0;
                self.accept_frame(&shot);
                self.recorder.refresh_pending(shot)?;
                self.recorder.note(format!("refreshed screenshot for step {index}"));
                Ok(StepOutcome::Refreshed)
            }
            Err(e) => Ok(self.fail(index, None, e)),
        }
    }

    /// Seals the trajectory with `done` and persists it.
    pub fn finish(&mut self) -> Result<StepOutcome, SessionError> {
        self.require(SessionState::AwaitingAction, "finish")?;
        if let Some(failed) = self.failed.take() {
            self.recorder.record_incident(
                Some(failed.index),
                Some(failed.action),
                "dropped at finish",
            );
        }
        self.recorder.append_done()?;
        self.state = SessionState::Finished;
        self.end = Some(SessionEnd::Finished);
        info!(
            "task {} finished after {} steps",
            self.task.task_id,
            self.recorder.len() - 1
        );

        let report = self.recorder.finalize(
            &self.output_root,
            &self.task.task_id,
            &mut self.evaluator,
            &SessionEnd::Finished,
        )?;
        self.report = Some(report.clone());
        Ok(StepOutcome::Finished(report))
    }

    /// Ends the session and persists whatever was recorded. Has no effect once
    /// the session has ended.
    pub fn abort(&mut self, reason: impl Into<String>) -> StepOutcome {
        let reason = reason.into();
        if self.state.is_terminal() {
            warn!("ignoring abort ({reason}): session already {:?}", self.state);
            return StepOutcome::Ignored;
        }
        error!("aborting session for {}: {reason}", self.task.task_id);
        self.failed = None;
        self.pointer_mode = PointerMode::Click;
        self.recorder.note(format!("session aborted: {reason}"));
        self.state = SessionState::Aborted;

        let end = SessionEnd::Aborted { reason: reason.clone() };
        self.end = Some(end.clone());
        let finalize = self.recorder.finalize(
            &self.output_root,
            &self.task.task_id,
            &mut self.evaluator,
            &end,
        );
        match &finalize {
            Ok(report) => {
                info!("partial trajectory saved to {}", report.task_dir.display());
                self.report = Some(report.clone());
            }
            Err(e) => error!("could not save partial trajectory: {e}"),
        }
        StepOutcome::Aborted { reason, finalize }
    }

    /// Repeats persistence after a failed finalize.
    pub fn finalize_again(&mut self) -> Result<FinalizeReport, SessionError> {
        let Some(end) = self.end.clone() else {
            return Err(SessionError::InvalidState {
                operation: "finalize",
                state: self.state,
            });
        };
        let report = self.recorder.finalize(
            &self.output_root,
            &self.task.task_id,
            &mut self.evaluator,
            &end,
        )?;
        self.report = Some(report.clone());
        Ok(report)
    }

    fn require(&self, wanted: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state != wanted {
            return Err(SessionError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn require_resolved(&self) -> Result<(), SessionError> {
        match &self.failed {
            Some(failed) => Err(SessionError::UnresolvedFailure { index: failed.index }),
            None => Ok(()),
        }
    }

    /// Records a VM failure and decides whether the session survives it.
    fn fail(&mut self, index: usize, attempt: Option<(Action, bool)>, err: VmError) -> StepOutcome {
        let action = attempt.as_ref().map(|(a, _)| a.clone());
        warn!("step {index} failed: {err}");
        self.recorder.record_incident(Some(index), action, err.to_string());

        if err.is_fatal() {
            return self.abort(format!("VM connection lost: {err}"));
        }
        if err.is_timeout() {
            self.consecutive_timeouts += 1;
            if self.consecutive_timeouts >= self.options.max_consecutive_timeouts {
                let n = self.consecutive_timeouts;
                return self.abort(format!("{n} consecutive VM timeouts"));
            }
        } else {
            self.consecutive_timeouts = 0;
        }

        if let Some((action, executed)) = attempt {
            self.failed = Some(FailedStep {
                index,
                action,
                error: err.clone(),
                executed,
            });
        }
        self.state = SessionState::AwaitingAction;
        StepOutcome::Failed { index, error: err }
    }

    /// Takes a screenshot, retrying timeouts and undecodable frames.
    fn capture(&mut self) -> Result<Screenshot, VmError> {
        let attempts = self.options.screenshot_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.vm.screenshot() {
                Ok(shot) => return Ok(shot),
                Err(e) if e.is_fatal() || attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!("screenshot attempt {attempt}/{attempts} failed: {e}");
                    attempt += 1;
                    if !self.options.screenshot_retry_delay.is_zero() {
                        thread::sleep(self.options.screenshot_retry_delay);
                    }
                }
            }
        }
    }

    fn accept_frame(&mut self, shot: &Screenshot) {
        let size = Size::new(shot.width(), shot.height());
        if self.viewport.state().vm_frame_size != size {
            info!("VM frame is {}x{}", size.width, size.height);
            self.viewport.set_frame_size(size);
        }
        self.frame_generation += 1;
    }
}
