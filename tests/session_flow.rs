use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use viewport_sft::action::{Action, MouseButton, ScrollDirection};
use viewport_sft::error::{EvaluationError, SessionError, VmError};
use viewport_sft::evaluate::Evaluator;
use viewport_sft::session::{
    InputFocus, PointerMode, RawEvent, Session, SessionOptions, SessionState, SessionTask,
    StepOutcome,
};
use viewport_sft::trajectory::{
    ACTION_LOG_FILE, METADATA_FILE, Outcome, SCORE_FILE, SessionMetadata, TrajectoryLine,
};
use viewport_sft::vm::{Screenshot, VmInterface};
use viewport_sft::{Point, Size};

const WINDOW: Size = Size::new(400, 300);
const FRAME: Size = Size::new(960, 540);
const TASK_ID: &str = "os/open-terminal";

#[derive(Default)]
struct Script {
    calls: Vec<String>,
    action_errors: VecDeque<VmError>,
    screenshot_errors: VecDeque<VmError>,
    shots: u32,
}

/// VM double whose failures are queued up front by the test.
#[derive(Clone, Default)]
struct FakeVm(Rc<RefCell<Script>>);

impl FakeVm {
    fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    fn fail_next_action(&self, err: VmError) {
        self.0.borrow_mut().action_errors.push_back(err);
    }

    fn fail_next_screenshot(&self, err: VmError) {
        self.0.borrow_mut().screenshot_errors.push_back(err);
    }

    fn act(&mut self, call: String) -> Result<(), VmError> {
        let mut script = self.0.borrow_mut();
        script.calls.push(call);
        match script.action_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl VmInterface for FakeVm {
    fn screenshot(&mut self) -> Result<Screenshot, VmError> {
        let mut script = self.0.borrow_mut();
        if let Some(err) = script.screenshot_errors.pop_front() {
            return Err(err);
        }
        script.shots += 1;
        let shade = (script.shots % 255) as u8;
        Ok(Screenshot::from_pixel(FRAME.width, FRAME.height, image::Rgba([shade, 0, 0, 255])))
    }

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> Result<(), VmError> {
        self.act(format!("click {x} {y} {button:?}"))
    }

    fn type_text(&mut self, text: &str) -> Result<(), VmError> {
        self.act(format!("type {text}"))
    }

    fn send_hotkey(&mut self, keys: &[String]) -> Result<(), VmError> {
        self.act(format!("hotkey {}", keys.join("+")))
    }

    fn send_key(&mut self, name: &str) -> Result<(), VmError> {
        self.act(format!("key {name}"))
    }

    fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), VmError> {
        self.act(format!("scroll {direction:?} {amount}"))
    }

    fn drag(&mut self, from: Point, to: Point) -> Result<(), VmError> {
        self.act(format!("drag {} {} {} {}", from.x, from.y, to.x, to.y))
    }
}

struct FixedScore(f64);

impl Evaluator for FixedScore {
    fn evaluate(&mut self, task_id: &str, _root: &Path) -> Result<f64, EvaluationError> {
        assert_eq!(task_id, TASK_ID);
        Ok(self.0)
    }
}

fn timeout() -> VmError {
    VmError::Timeout {
        operation: "click".into(),
        timeout_ms: 5000,
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        settle_delay: Duration::ZERO,
        screenshot_retry_delay: Duration::ZERO,
        ..SessionOptions::default()
    }
}

fn started(root: &Path) -> (Session<FakeVm, FixedScore>, FakeVm) {
    let vm = FakeVm::default();
    let task = SessionTask {
        task_id: TASK_ID.into(),
        instruction: "Open a terminal".into(),
    };
    let mut session = Session::new(vm.clone(), FixedScore(1.0), task, root, WINDOW, options());
    session.start().unwrap();
    (session, vm)
}

fn click(x: i32, y: i32) -> RawEvent {
    RawEvent::PointerClick {
        position: Point::new(x, y),
        button: MouseButton::Left,
    }
}

fn read_lines(dir: &Path) -> Vec<TrajectoryLine> {
    fs::read_to_string(dir.join(ACTION_LOG_FILE))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn read_metadata(dir: &Path) -> SessionMetadata {
    serde_json::from_slice(&fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap()
}

fn png_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".png")
        })
        .count()
}

#[test]
fn three_clicks_then_finish() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());

    for (i, x) in [10, 20, 30].into_iter().enumerate() {
        match session.handle(click(x, 40)).unwrap() {
            StepOutcome::Recorded { index, .. } => assert_eq!(index, i),
            other => panic!("unexpected {other:?}"),
        }
    }
    let report = match session.handle(RawEvent::Finish).unwrap() {
        StepOutcome::Finished(report) => report,
        other => panic!("unexpected {other:?}"),
    };

    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.recorder().len(), 4);
    assert_eq!(vm.calls().len(), 3);

    let dir = root.path().join(TASK_ID);
    assert_eq!(report.task_dir, dir);
    assert_eq!(png_count(&dir), 6);

    let lines = read_lines(&dir);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3].action, Action::Done);
    assert_eq!(lines[1].command, "pyautogui.click(20, 40)");

    assert_eq!(fs::read_to_string(dir.join(SCORE_FILE)).unwrap(), "1");
    let meta = read_metadata(&dir);
    assert!(meta.complete);
    assert_eq!(meta.total_steps, 3);
    assert_eq!(meta.outcome, Outcome::Finished);
}

#[test]
fn clicks_are_translated_by_the_pan_offset() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());
    assert_eq!(session.viewport().state().vm_frame_size, FRAME);

    session.pan_to(Point::new(200, 100));
    session.handle(click(50, 50)).unwrap();

    assert_eq!(vm.calls(), vec!["click 250 150 Left"]);
    assert_eq!(
        session.recorder().steps()[0].action,
        Action::Click { x: 250, y: 150, button: MouseButton::Left }
    );
}

#[test]
fn abort_persists_completed_steps_plus_done() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, _vm) = started(root.path());
    session.handle(click(5, 5)).unwrap();
    session.handle(RawEvent::Key("enter".into())).unwrap();

    match session.handle(RawEvent::Abort).unwrap() {
        StepOutcome::Aborted { reason, finalize } => {
            assert_eq!(reason, "operator abort");
            assert!(finalize.is_ok());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Aborted);

    let dir = root.path().join(TASK_ID);
    let lines = read_lines(&dir);
    assert_eq!(lines.len(), 3);
    assert!(lines[2].action.is_done());

    let meta = read_metadata(&dir);
    assert!(!meta.complete);
    assert_eq!(meta.outcome, Outcome::Aborted);
    assert_eq!(meta.total_steps, 2);

    // Aborting twice changes nothing.
    assert!(matches!(session.abort("again"), StepOutcome::Ignored));
    assert_eq!(read_lines(&dir).len(), 3);
}

#[test]
fn repeated_timeouts_escalate_to_abort() {
    let root = tempfile::tempdir().unwrap();
    let vm = FakeVm::default();
    let task = SessionTask {
        task_id: TASK_ID.into(),
        instruction: "Open a terminal".into(),
    };
    let opts = SessionOptions {
        screenshot_attempts: 1,
        ..options()
    };
    let mut session = Session::new(vm.clone(), FixedScore(0.0), task, root.path(), WINDOW, opts);
    session.start().unwrap();
    vm.fail_next_action(timeout());
    for _ in 0..2 {
        vm.fail_next_screenshot(VmError::Timeout {
            operation: "screenshot".into(),
            timeout_ms: 5000,
        });
    }

    assert!(matches!(
        session.handle(click(1, 1)).unwrap(),
        StepOutcome::Failed { index: 0, .. }
    ));
    assert!(matches!(session.retry().unwrap(), StepOutcome::Failed { .. }));
    assert!(matches!(session.retry().unwrap(), StepOutcome::Aborted { .. }));
    assert_eq!(session.state(), SessionState::Aborted);
    assert_eq!(vm.calls(), vec!["click 1 1 Left"]);

    let meta = read_metadata(&root.path().join(TASK_ID));
    assert!(!meta.complete);
    assert!(meta.abort_reason.unwrap().contains("consecutive"));
    assert!(meta.incidents.len() >= 3);
}

#[test]
fn timed_out_action_is_not_sent_twice() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());
    vm.fail_next_action(VmError::Timeout {
        operation: "type".into(),
        timeout_ms: 5000,
    });

    let long = "a".repeat(120);
    let outcome = session.handle(RawEvent::TypeText(long.clone())).unwrap();
    assert!(matches!(outcome, StepOutcome::Failed { index: 0, .. }));
    assert!(session.failed_step().unwrap().executed);

    match session.retry().unwrap() {
        StepOutcome::Recorded { index, action } => {
            assert_eq!(index, 0);
            assert_eq!(action, Action::Type { text: long.clone() });
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(vm.calls(), vec![format!("type {long}")]);
}

#[test]
fn a_success_resets_the_timeout_count() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());

    for _ in 0..2 {
        vm.fail_next_action(timeout());
        session.handle(click(1, 1)).unwrap();
        assert!(matches!(session.retry().unwrap(), StepOutcome::Recorded { .. }));
    }
    assert_eq!(session.state(), SessionState::AwaitingAction);
    assert_eq!(session.recorder().len(), 2);
    assert_eq!(vm.calls().len(), 2);
}

#[test]
fn rejected_action_can_be_retried() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());
    vm.fail_next_action(VmError::Rejected {
        command: "pyautogui.press('f13')".into(),
        reason: "bad key".into(),
    });

    let outcome = session.handle(RawEvent::Key("f13".into())).unwrap();
    assert!(matches!(outcome, StepOutcome::Failed { index: 0, .. }));
    assert_eq!(session.state(), SessionState::AwaitingAction);
    assert!(session.has_failed_step());

    let blocked = session.handle(click(3, 3)).unwrap_err();
    assert!(matches!(blocked, SessionError::UnresolvedFailure { index: 0 }));

    assert!(matches!(
        session.retry().unwrap(),
        StepOutcome::Recorded { index: 0, .. }
    ));
    assert_eq!(vm.calls(), vec!["key f13", "key f13"]);
    assert!(!session.recorder().incidents().is_empty());
}

#[test]
fn skipped_action_leaves_no_record() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());
    vm.fail_next_action(VmError::Rejected {
        command: "pyautogui.click(1, 1)".into(),
        reason: "no target".into(),
    });

    session.handle(click(1, 1)).unwrap();
    assert!(matches!(session.skip().unwrap(), StepOutcome::Refreshed));
    assert!(!session.has_failed_step());
    assert!(session.recorder().is_empty());

    assert!(matches!(
        session.handle(click(2, 2)).unwrap(),
        StepOutcome::Recorded { index: 0, .. }
    ));
    let incidents = session.recorder().incidents();
    assert_eq!(incidents.len(), 2);
    assert_eq!(incidents[1].error, "skipped by operator");
}

#[test]
fn failed_capture_is_retried_without_repeating_the_action() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());
    for _ in 0..3 {
        vm.fail_next_screenshot(VmError::Timeout {
            operation: "screenshot".into(),
            timeout_ms: 5000,
        });
    }

    match session.handle(click(7, 8)).unwrap() {
        StepOutcome::Failed { index, error } => {
            assert_eq!(index, 0);
            assert!(error.is_timeout());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.failed_step().unwrap().executed);

    assert!(matches!(
        session.retry().unwrap(),
        StepOutcome::Recorded { index: 0, .. }
    ));
    assert_eq!(vm.calls(), vec!["click 7 8 Left"]);
}

#[test]
fn lost_connection_aborts_and_saves() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());
    session.handle(click(1, 1)).unwrap();
    vm.fail_next_action(VmError::Fatal {
        operation: "click".into(),
        reason: "connection refused".into(),
    });

    match session.handle(click(2, 2)).unwrap() {
        StepOutcome::Aborted { finalize, .. } => assert!(finalize.is_ok()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Aborted);
    let lines = read_lines(&root.path().join(TASK_ID));
    assert_eq!(lines.len(), 2);

    let late = session.handle(click(3, 3)).unwrap_err();
    assert!(matches!(late, SessionError::InvalidState { .. }));
}

#[test]
fn overlay_focus_suspends_panning() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, _vm) = started(root.path());
    let corner = Some(Point::new(399, 299));

    session.handle(RawEvent::ToggleOverlay).unwrap();
    assert_eq!(session.focus(), InputFocus::Overlay);
    assert_eq!(session.tick(corner, 0.5), Point::ORIGIN);

    session.handle(RawEvent::ToggleOverlay).unwrap();
    let pan = session.tick(corner, 0.5);
    assert!(pan.x > 0 && pan.y > 0, "{pan:?}");
    assert!(pan.x <= 560 && pan.y <= 240);
}

#[test]
fn drag_mode_takes_two_clicks() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());
    session.pan_to(Point::new(100, 0));

    session.handle(RawEvent::ToggleDrag).unwrap();
    assert!(matches!(session.handle(click(10, 20)).unwrap(), StepOutcome::Ignored));
    assert_eq!(
        session.pointer_mode(),
        PointerMode::DragEnd { start: Point::new(110, 20) }
    );

    let outcome = session.handle(click(60, 70)).unwrap();
    assert!(matches!(outcome, StepOutcome::Recorded { index: 0, .. }));
    assert_eq!(vm.calls(), vec!["drag 110 20 160 70"]);
    assert_eq!(session.pointer_mode(), PointerMode::Click);

    session.handle(RawEvent::ToggleDrag).unwrap();
    let cancel = RawEvent::PointerClick {
        position: Point::new(5, 5),
        button: MouseButton::Right,
    };
    assert!(matches!(session.handle(cancel).unwrap(), StepOutcome::Ignored));
    assert_eq!(session.pointer_mode(), PointerMode::Click);
    assert_eq!(vm.calls().len(), 1);
}

#[test]
fn refresh_replaces_the_open_before_shot() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, _vm) = started(root.path());
    let generation = session.frame_generation();

    assert!(matches!(session.handle(RawEvent::Refresh).unwrap(), StepOutcome::Refreshed));
    assert_eq!(session.frame_generation(), generation + 1);
    let shade = session.current_frame().unwrap().get_pixel(0, 0)[0];
    assert_eq!(shade, 2);
    assert!(session.recorder().is_empty());
}

#[test]
fn unreachable_vm_at_start_aborts() {
    let root = tempfile::tempdir().unwrap();
    let vm = FakeVm::default();
    vm.fail_next_screenshot(VmError::Fatal {
        operation: "screenshot".into(),
        reason: "connection refused".into(),
    });
    let task = SessionTask {
        task_id: TASK_ID.into(),
        instruction: "Open a terminal".into(),
    };
    let mut session = Session::new(vm, FixedScore(0.0), task, root.path(), WINDOW, options());

    assert!(matches!(session.start(), Err(SessionError::Aborted { .. })));
    assert_eq!(session.state(), SessionState::Aborted);
    assert_eq!(read_lines(&root.path().join(TASK_ID)).len(), 1);
}

#[test]
fn periodic_checkpoint_writes_before_finish() {
    let root = tempfile::tempdir().unwrap();
    let vm = FakeVm::default();
    let task = SessionTask {
        task_id: TASK_ID.into(),
        instruction: "Open a terminal".into(),
    };
    let opts = SessionOptions {
        checkpoint_every: 2,
        ..options()
    };
    let mut session = Session::new(vm, FixedScore(1.0), task, root.path(), WINDOW, opts);
    session.start().unwrap();

    session.handle(click(1, 1)).unwrap();
    let dir = root.path().join(TASK_ID);
    assert!(!dir.exists());

    session.handle(click(2, 2)).unwrap();
    assert_eq!(png_count(&dir), 4);
    assert_eq!(read_lines(&dir).len(), 2);
    assert!(session.recorder().steps().iter().all(|s| s.flushed));
    assert!(session.current_frame().is_some());

    session.handle(click(3, 3)).unwrap();
    session.finish().unwrap();
    assert_eq!(png_count(&dir), 6);
    let lines = read_lines(&dir);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0].screenshot_after.as_deref(), Some("step_0000_after.png"));
}

#[test]
fn failed_checkpoint_is_an_incident() {
    let root = tempfile::tempdir().unwrap();
    let vm = FakeVm::default();
    let task = SessionTask {
        task_id: TASK_ID.into(),
        instruction: "Open a terminal".into(),
    };
    let opts = SessionOptions {
        checkpoint_every: 1,
        ..options()
    };
    let mut session = Session::new(vm, FixedScore(1.0), task, root.path(), WINDOW, opts);
    session.start().unwrap();

    // The domain directory cannot be created while a file sits in its place.
    let blocker = root.path().join("os");
    fs::write(&blocker, b"in the way").unwrap();
    assert!(matches!(
        session.handle(click(1, 1)).unwrap(),
        StepOutcome::Recorded { index: 0, .. }
    ));
    fs::remove_file(&blocker).unwrap();

    session.finish().unwrap();
    let meta = read_metadata(&root.path().join(TASK_ID));
    let failed: Vec<_> = meta
        .incidents
        .iter()
        .filter(|i| i.error.starts_with("checkpoint failed"))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].step, None);
    assert_eq!(meta.total_steps, 1);
}

#[test]
fn invalid_wait_is_refused_before_dispatch() {
    let root = tempfile::tempdir().unwrap();
    let (mut session, vm) = started(root.path());

    let err = session.handle(RawEvent::Wait(-1.0)).unwrap_err();
    assert!(matches!(err, SessionError::InvalidWait { .. }));
    assert!(session.handle(RawEvent::Wait(1e30)).is_err());
    assert!(session.recorder().is_empty());
    assert!(vm.calls().is_empty());
}
