pub mod action;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod logging;
pub mod mapper;
pub mod notebook;
pub mod session;
pub mod task;
pub mod trajectory;
pub mod viewport;
pub mod vm;

pub use action::Action;
pub use config::RecorderConfig;
pub use error::{
    ConfigError, EvaluationError, PersistenceError, SequenceError, SessionError, TaskError,
    VmError,
};
pub use mapper::{Point, Size, ViewportState};
pub use session::{InputFocus, RawEvent, Session, SessionState, StepOutcome};
pub use trajectory::{StepRecord, TrajectoryRecorder};
pub use viewport::ViewportController;
pub use vm::{HttpVm, Screenshot, VmInterface};
