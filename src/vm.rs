use std::time::Duration;

use image::{ImageFormat, RgbaImage};
use log::{debug, warn};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use crate::action::{Action, MouseButton, ScrollDirection};
use crate::error::VmError;
use crate::mapper::Point;

/// A decoded VM framebuffer capture.
pub type Screenshot = RgbaImage;

/// Synchronous request/response access to the VM being controlled.
///
/// Every call blocks until the VM answers or the call times out.
pub trait VmInterface {
    fn screenshot(&mut self) -> Result<Screenshot, VmError>;
    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> Result<(), VmError>;
    fn type_text(&mut self, text: &str) -> Result<(), VmError>;
    fn send_hotkey(&mut self, keys: &[String]) -> Result<(), VmError>;
    fn send_key(&mut self, name: &str) -> Result<(), VmError>;
    fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), VmError>;
    fn drag(&mut self, from: Point, to: Point) -> Result<(), VmError>;
}

/// Sends `action` to the VM. `Wait` sleeps locally and `Done` is a no-op.
pub fn dispatch<V: VmInterface + ?Sized>(vm: &mut V, action: &Action) -> Result<(), VmError> {
    match action {
        Action::Click { x, y, button } => vm.click(*x, *y, *button),
        Action::Type { text } => vm.type_text(text),
        Action::Hotkey { keys } => vm.send_hotkey(keys),
        Action::Key { name } => vm.send_key(name),
        Action::Scroll { direction, amount } => vm.scroll(*direction, *amount),
        Action::Drag {
            start_x,
            start_y,
            end_x,
            end_y,
        } => vm.drag(Point::new(*start_x, *start_y), Point::new(*end_x, *end_y)),
        Action::Wait { seconds } => {
            let pause = Duration::try_from_secs_f32(*seconds).map_err(|e| VmError::Rejected {
                command: action.command(),
                reason: e.to_string(),
            })?;
            std::thread::sleep(pause);
            Ok(())
        }
        Action::Done => Ok(()),
    }
}

const PYTHON_PRELUDE: &str = "import pyautogui; import time; pyautogui.FAILSAFE = False";

/// Extra time granted to commands that keep the VM busy, on top of their playback time.
const PLAYBACK_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    returncode: Option<i64>,
}

/// Talks to the control server running inside the guest.
///
/// `timeout` bounds screenshots and instant commands. Commands that replay
/// over time (typing, drags) get their playback time added to it.
pub struct HttpVm {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpVm {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, VmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VmError::Fatal {
                operation: "connect".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: format!("http://{host}:{port}"),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Time allowed for `/execute` to answer for `action`.
    pub fn execute_timeout(&self, action: &Action) -> Duration {
        let playback = action.playback_time();
        if playback.is_zero() {
            self.timeout
        } else {
            self.timeout + playback + PLAYBACK_SLACK
        }
    }

    fn classify(&self, operation: &str, timeout: Duration, err: reqwest::Error) -> VmError {
        if err.is_timeout() {
            VmError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            VmError::Fatal {
                operation: operation.to_string(),
                reason: err.to_string(),
            }
        }
    }

    fn run(&self, action: &Action) -> Result<(), VmError> {
        let command = action.command();
        debug!("executing in VM: {command}");
        let body = json!({
            "command": ["python", "-c", format!("{PYTHON_PRELUDE}; {command}")],
            "shell": false,
        });

        let timeout = self.execute_timeout(action);
        let response = self
            .client
            .post(format!("{}/execute", self.base_url))
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|e| self.classify(action.kind(), timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            warn!("VM answered {status} for `{command}`");
            return Err(VmError::Rejected {
                command,
                reason: format!("HTTP {status}: {}", text.trim()),
            });
        }

        let parsed: ExecuteResponse = response.json().map_err(|e| VmError::Rejected {
            command: command.clone(),
            reason: format!("malformed execute response: {e}"),
        })?;

        let failed = parsed.status != "success" || parsed.returncode.is_some_and(|rc| rc != 0);
        if failed {
            return Err(VmError::Rejected {
                command,
                reason: parsed
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| format!("status {:?}", parsed.status)),
            });
        }
        Ok(())
    }
}

impl VmInterface for HttpVm {
    fn screenshot(&mut self) -> Result<Screenshot, VmError> {
        let response = self
            .client
            .get(format!("{}/screenshot", self.base_url))
            .send()
            .map_err(|e| self.classify("screenshot", self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VmError::BadScreenshot(format!("HTTP {status}")));
        }
        let bytes = response
            .bytes()
            .map_err(|e| self.classify("screenshot", self.timeout, e))?;
        let img = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .map_err(|e| VmError::BadScreenshot(e.to_string()))?;
        Ok(img.to_rgba8())
    }

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> Result<(), VmError> {
        self.run(&Action::Click { x, y, button })
    }

    fn type_text(&mut self, text: &str) -> Result<(), VmError> {
        self.run(&Action::Type { text: text.to_string() })
    }

    fn send_hotkey(&mut self, keys: &[String]) -> Result<(), VmError> {
        self.run(&Action::Hotkey { keys: keys.to_vec() })
    }

    fn send_key(&mut self, name: &str) -> Result<(), VmError> {
        self.run(&Action::Key { name: name.to_string() })
    }

    fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), VmError> {
        self.run(&Action::Scroll { direction, amount })
    }

    fn drag(&mut self, from: Point, to: Point) -> Result<(), VmError> {
        self.run(&Action::Drag {
            start_x: from.x,
            start_y: from.y,
            end_x: to.x,
            end_y: to.y,
        })
    }
}
