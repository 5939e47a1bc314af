use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mapper::Size;
use crate::session::SessionOptions;
use crate::viewport::{DEFAULT_PAN_MARGIN, DEFAULT_PAN_SPEED};

pub const ENV_VM_HOST: &str = "VIEWPORT_SFT_VM_HOST";
pub const ENV_VM_PORT: &str = "VIEWPORT_SFT_VM_PORT";
pub const ENV_EVAL_CMD: &str = "VIEWPORT_SFT_EVAL_CMD";
pub const ENV_RESULT_DIR: &str = "VIEWPORT_SFT_RESULT_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub vm_host: String,
    pub vm_port: u16,
    pub request_timeout_ms: u64,
    pub screen_width: u32,
    pub screen_height: u32,
    pub pan_margin: u32,
    /// Pixels per second with the cursor on the window edge.
    pub pan_speed: f32,
    pub settle_delay_ms: u64,
    pub screenshot_retries: u32,
    pub screenshot_retry_delay_ms: u64,
    pub max_consecutive_timeouts: u32,
    /// Steps between screenshot flushes; 0 keeps everything in memory.
    pub checkpoint_every: usize,
    pub result_dir: PathBuf,
    pub evaluate_command: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            vm_host: "127.0.0.1".into(),
            vm_port: 5000,
            request_timeout_ms: 5_000,
            screen_width: 1920,
            screen_height: 1080,
            pan_margin: DEFAULT_PAN_MARGIN,
            pan_speed: DEFAULT_PAN_SPEED,
            settle_delay_ms: 500,
            screenshot_retries: 3,
            screenshot_retry_delay_ms: 1_000,
            max_consecutive_timeouts: 3,
            checkpoint_every: 20,
            result_dir: PathBuf::from("./SFT"),
            evaluate_command: None,
        }
    }
}

impl RecorderConfig {
    /// `<config_dir>/viewport-sft/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("viewport-sft").join("config.json"))
    }

    /// Loads `path` when given (it must exist), otherwise the default path if
    /// present, otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlays environment values supplied by `lookup`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup(ENV_VM_HOST) {
            self.vm_host = host;
        }
        if let Some(port) = lookup(ENV_VM_PORT) {
            self.vm_port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_VM_PORT.into(),
                value: port.clone(),
            })?;
        }
        if let Some(cmd) = lookup(ENV_EVAL_CMD) {
            self.evaluate_command = Some(cmd).filter(|c| !c.trim().is_empty());
        }
        if let Some(dir) = lookup(ENV_RESULT_DIR) {
            self.result_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vm_host.trim().is_empty() {
            return Err(ConfigError::Invalid("vm_host is empty".into()));
        }
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "screen size {}x{} is empty",
                self.screen_width, self.screen_height
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        if !(self.pan_speed.is_finite() && self.pan_speed >= 0.0) {
            return Err(ConfigError::Invalid(format!("pan_speed {} is invalid", self.pan_speed)));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_timeouts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn screen_size(&self) -> Size {
        Size::new(self.screen_width, self.screen_height)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            screenshot_attempts: self.screenshot_retries.max(1),
            screenshot_retry_delay: Duration::from_millis(self.screenshot_retry_delay_ms),
            max_consecutive_timeouts: self.max_consecutive_timeouts,
            pan_margin: self.pan_margin,
            pan_speed: self.pan_speed,
            checkpoint_every: self.checkpoint_every,
        }
    }
}
