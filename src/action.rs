use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// A single discrete operator action, in VM pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { x: i32, y: i32, button: MouseButton },
    Type { text: String },
    Hotkey { keys: Vec<String> },
    Key { name: String },
    Scroll { direction: ScrollDirection, amount: u32 },
    Drag { start_x: i32, start_y: i32, end_x: i32, end_y: i32 },
    Wait { seconds: f32 },
    Done,
}

/// Seconds a recorded drag takes to play back.
pub const DRAG_DURATION_SECS: f32 = 0.5;

/// Pause pyautogui makes between typed characters.
pub const TYPE_INTERVAL_SECS: f32 = 0.05;

/// Longest wait the operator may record.
pub const MAX_WAIT_SECS: f32 = 60.0;

pub const HOTKEY_PRESETS: &[(&str, &[&str])] = &[
    ("Ctrl+S", &["ctrl", "s"]),
    ("Ctrl+Shift+S", &["ctrl", "shift", "s"]),
    ("Ctrl+C", &["ctrl", "c"]),
    ("Ctrl+V", &["ctrl", "v"]),
    ("Ctrl+X", &["ctrl", "x"]),
    ("Ctrl+Z", &["ctrl", "z"]),
    ("Ctrl+A", &["ctrl", "a"]),
    ("Ctrl+F", &["ctrl", "f"]),
    ("Ctrl+H", &["ctrl", "h"]),
    ("Ctrl+N", &["ctrl", "n"]),
    ("Ctrl+O", &["ctrl", "o"]),
    ("Ctrl+P", &["ctrl", "p"]),
    ("Ctrl+W", &["ctrl", "w"]),
    ("Alt+F4", &["alt", "f4"]),
    ("Ctrl+Alt+T", &["ctrl", "alt", "t"]),
];

pub const SPECIAL_KEYS: &[&str] = &[
    "enter",
    "tab",
    "escape",
    "backspace",
    "delete",
    "up",
    "down",
    "left",
    "right",
    "space",
    "home",
    "end",
    "pageup",
    "pagedown",
];

pub const WAIT_PRESETS: &[f32] = &[0.5, 1.0, 2.0, 3.0, 5.0, 10.0];

/// A wait must be a positive, finite number of seconds up to [`MAX_WAIT_SECS`].
pub fn is_valid_wait(seconds: f32) -> bool {
    seconds.is_finite() && seconds > 0.0 && seconds <= MAX_WAIT_SECS
}

impl Action {
    /// Stable tag used in logs and file formats.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { button: MouseButton::Left, .. } => "click",
            Action::Click { button: MouseButton::Right, .. } => "right_click",
            Action::Click { button: MouseButton::Middle, .. } => "middle_click",
            Action::Type { .. } => "type",
            Action::Hotkey { .. } => "hotkey",
            Action::Key { .. } => "key",
            Action::Scroll { .. } => "scroll",
            Action::Drag { .. } => "drag",
            Action::Wait { .. } => "wait",
            Action::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done)
    }

    /// How long the VM is busy replaying this action, beyond the round trip.
    pub fn playback_time(&self) -> Duration {
        match self {
            Action::Type { text } => {
                Duration::from_secs_f32(TYPE_INTERVAL_SECS * text.chars().count() as f32)
            }
            Action::Drag { .. } => Duration::from_secs_f32(DRAG_DURATION_SECS),
            _ => Duration::ZERO,
        }
    }

    /// The pyautogui command that replays this action inside the VM.
    pub fn command(&self) -> String {
        match self {
            Action::Click { x, y, button } => {
                let func = match button {
                    MouseButton::Left => "click",
                    MouseButton::Right => "rightClick",
                    MouseButton::Middle => "middleClick",
                };
                format!("pyautogui.{func}({x}, {y})")
            }
            Action::Type { text } => {
                format!(
                    "pyautogui.typewrite({}, interval={TYPE_INTERVAL_SECS})",
                    py_str(text)
                )
            }
            Action::Hotkey { keys } => {
                let args: Vec<String> = keys.iter().map(|k| py_str(k)).collect();
                format!("pyautogui.hotkey({})", args.join(", "))
            }
            Action::Key { name } => format!("pyautogui.press({})", py_str(name)),
            Action::Scroll { direction, amount } => {
                let amount = *amount as i64;
                match direction {
                    ScrollDirection::Up => format!("pyautogui.scroll({amount})"),
                    ScrollDirection::Down => format!("pyautogui.scroll({})", -amount),
                    ScrollDirection::Left => format!("pyautogui.hscroll({})", -amount),
                    ScrollDirection::Right => format!("pyautogui.hscroll({amount})"),
                }
            }
            Action::Drag {
                start_x,
                start_y,
                end_x,
                end_y,
            } => format!(
                "pyautogui.moveTo({start_x}, {start_y}); pyautogui.drag({}, {}, duration={DRAG_DURATION_SECS})",
                end_x - start_x,
                end_y - start_y
            ),
            Action::Wait { seconds } => format!("time.sleep({seconds})"),
            Action::Done => "DONE".to_string(),
        }
    }
}

/// Single-quoted Python string literal.
fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}
